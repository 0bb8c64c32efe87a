use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{GlusterError, Result};

/// Looked up in the working directory when `--cfg` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "gluster.json";

/// Node settings: the cluster section is shared with `consensus`, the API
/// port is ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub cluster: consensus::Config,
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: consensus::Config::default(),
            api_port: api::DEFAULT_API_PORT,
        }
    }
}

pub fn command() -> Command {
    Command::new("gluster")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cluster coordination node: leader election, replicated key-value table and service registry")
        .arg(
            Arg::new("ip")
                .long("ip")
                .help("IP address to bind and advertise")
                .required(false)
        )
        .arg(
            Arg::new("peers")
                .long("peers")
                .help("Comma-separated list of peer addresses (ip or ip:port)")
                .required(false)
        )
        .arg(
            Arg::new("group")
                .long("group")
                .help("Cluster group name; nodes only talk within their group")
                .required(false)
        )
        .arg(
            Arg::new("cfg")
                .long("cfg")
                .help("Path to a JSON config file")
                .required(false)
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .help("Directory for the snapshot file")
                .required(false)
        )
        .arg(
            Arg::new("api-port")
                .long("api-port")
                .help("HTTP API port")
                .required(false)
        )
        .arg(
            Arg::new("min-nodes")
                .long("min-nodes")
                .help("Live nodes required before an election may start")
                .required(false)
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .help("Scan the local /24 subnet for peers")
                .action(ArgAction::SetTrue)
        )
}

impl Config {
    /// Reads the config file named by `--cfg`, or `gluster.json` if present,
    /// then applies the command line on top.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<String>("cfg") {
            Some(path) => Self::load(Path::new(path))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply(matches)?;
        config
            .cluster
            .validate()
            .map_err(|e| GlusterError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            GlusterError::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn apply(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(ip) = matches.get_one::<String>("ip") {
            self.cluster.node_ip = IpAddr::from_str(ip.trim())
                .map_err(|e| GlusterError::InvalidConfig(format!("Invalid IP address: {}", e)))?;
        }

        if let Some(peers) = matches.get_one::<String>("peers") {
            for peer in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let addr = consensus::parse_peer_addr(peer, self.cluster.raft_port)
                    .map_err(|e| GlusterError::InvalidConfig(e.to_string()))?;
                if !self.cluster.peers.contains(&addr) {
                    self.cluster.peers.push(addr);
                }
            }
        }

        if let Some(group) = matches.get_one::<String>("group") {
            self.cluster.group = group.clone();
        }

        if let Some(dir) = matches.get_one::<String>("data-dir") {
            self.cluster.data_dir = PathBuf::from(dir);
        }

        if let Some(port) = matches.get_one::<String>("api-port") {
            self.api_port = port
                .parse::<u16>()
                .map_err(|e| GlusterError::InvalidConfig(format!("Invalid API port: {}", e)))?;
        }

        if let Some(min_nodes) = matches.get_one::<String>("min-nodes") {
            self.cluster.min_nodes = min_nodes
                .parse::<usize>()
                .map_err(|e| GlusterError::InvalidConfig(format!("Invalid min nodes: {}", e)))?;
        }

        if matches.get_flag("scan") {
            self.cluster.scan_subnet = true;
        }

        Ok(())
    }
}

impl From<Config> for consensus::Config {
    fn from(config: Config) -> Self {
        config.cluster
    }
}

impl From<Config> for api::Config {
    fn from(config: Config) -> Self {
        api::Config {
            bind: config.cluster.node_ip,
            port: config.api_port,
        }
    }
}
