mod election;
mod handlers;
mod heartbeat;
mod log;
mod manager;
mod membership;
mod persistence;
mod raft;
mod replication;
mod service;
mod split_brain;
mod state;

pub use log::ReplicationLog;
pub use manager::ConsensusManager;
pub use persistence::Snapshot;
pub use raft::RaftNode;
pub use service::{
    pick_weighted, HealthCheck, HealthChecker, HttpCheck, MysqlCheck, PostgresCheck, RedisCheck,
    ServiceRegistry, TcpCheck,
};
pub use state::NodeState;

pub use network::{
    ClusterRole, Endpoint, LogAction, LogEntry, LogId, NodeInfo, NodeStatus, RaftRole, Service,
};

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RAFT_PORT: u16 = 4166;
pub const DEFAULT_REPL_PORT: u16 = 4167;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub group: String,
    /// Overrides the id derived from hostname and addresses.
    pub node_id: Option<String>,
    pub node_name: String,
    /// Address to bind and advertise. Unspecified means "detect".
    pub node_ip: IpAddr,
    pub raft_port: u16,
    pub repl_port: u16,
    pub role: ClusterRole,
    pub min_nodes: usize,
    pub peers: Vec<SocketAddr>,
    pub scan_subnet: bool,
    pub data_dir: PathBuf,
    pub data_file: String,
    pub wire_compression: bool,
    pub snapshot_compression: bool,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub repl_heartbeat_interval_ms: u64,
    pub autosave_interval_ms: u64,
    pub log_clean_interval_ms: u64,
    pub peers_sync_interval_ms: u64,
    pub discovery_interval_ms: u64,
    pub service_check_interval_ms: u64,
    pub tcp_timeout_ms: u64,
    pub tcp_retry_count: u32,
    pub tcp_retry_backoff_ms: u64,
    pub dead_peer_eviction_ms: i64,
    pub services: Vec<Service>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            node_id: None,
            node_name: String::new(),
            node_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            raft_port: DEFAULT_RAFT_PORT,
            repl_port: DEFAULT_REPL_PORT,
            role: ClusterRole::Server,
            min_nodes: 1,
            peers: Vec::new(),
            scan_subnet: false,
            data_dir: PathBuf::from("."),
            data_file: "gluster.db".to_string(),
            wire_compression: true,
            snapshot_compression: false,
            election_timeout_min_ms: 500,
            election_timeout_max_ms: 1000,
            heartbeat_interval_ms: 500,
            repl_heartbeat_interval_ms: 1000,
            autosave_interval_ms: 1000,
            log_clean_interval_ms: 5000,
            peers_sync_interval_ms: 3000,
            discovery_interval_ms: 30_000,
            service_check_interval_ms: 2000,
            tcp_timeout_ms: 3000,
            tcp_retry_count: 3,
            tcp_retry_backoff_ms: 100,
            dead_peer_eviction_ms: 3 * 24 * 60 * 60 * 1000,
            services: Vec::new(),
        }
    }
}

impl Config {
    pub fn election_window(&self) -> (Duration, Duration) {
        let min = self.election_timeout_min_ms;
        let max = self.election_timeout_max_ms.max(min);
        (Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn repl_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.repl_heartbeat_interval_ms)
    }

    pub fn transport_config(&self) -> network::TransportConfig {
        let timeout = Duration::from_millis(self.tcp_timeout_ms);
        network::TransportConfig {
            group: self.group.clone(),
            connect_timeout: timeout,
            read_timeout: timeout,
            write_timeout: timeout,
            retry_count: self.tcp_retry_count,
            retry_backoff: Duration::from_millis(self.tcp_retry_backoff_ms),
            compression: compression(self.wire_compression),
            ..network::TransportConfig::default()
        }
    }

    /// Rejects timings the background loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("repl_heartbeat_interval_ms", self.repl_heartbeat_interval_ms),
            ("autosave_interval_ms", self.autosave_interval_ms),
            ("log_clean_interval_ms", self.log_clean_interval_ms),
            ("peers_sync_interval_ms", self.peers_sync_interval_ms),
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("service_check_interval_ms", self.service_check_interval_ms),
            ("election_timeout_min_ms", self.election_timeout_min_ms),
            ("tcp_timeout_ms", self.tcp_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConsensusError::InvalidConfig(format!("{} must be positive", name)));
        }
        if self.election_timeout_max_ms < self.election_timeout_min_ms {
            return Err(ConsensusError::InvalidConfig(format!(
                "election_timeout_max_ms ({}) is below election_timeout_min_ms ({})",
                self.election_timeout_max_ms, self.election_timeout_min_ms
            )));
        }
        Ok(())
    }

    pub fn snapshot_path(&self, ip: IpAddr) -> PathBuf {
        self.data_dir.join(format!("{}.{}", ip, self.data_file))
    }
}

pub(crate) fn compression(enabled: bool) -> storage::Compression {
    if enabled {
        storage::Compression::Zlib
    } else {
        storage::Compression::None
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("No leader elected")]
    NoLeader,

    #[error("Could not connect to leader {0}")]
    LeaderUnreachable(String),

    #[error("Rejected by leader: {0}")]
    Rejected(String),

    #[error("Not leader: current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No healthy endpoint for service {0}")]
    NoHealthyEndpoint(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task failed: {0}")]
    Task(String),
}

/// Parses `ip` or `ip:port`; a bare ip gets `default_port`.
pub fn parse_peer_addr(addr: &str, default_port: u16) -> Result<SocketAddr> {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok(socket);
    }
    addr.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| ConsensusError::InvalidAddress(addr.to_string()))
}
