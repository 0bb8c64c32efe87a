mod communication;
mod directory;
mod discovery;
mod manager;
mod message;

pub use communication::{Connection, Listener, MessageHandler, Transport, TransportConfig};
pub use directory::{now_millis, PeerDirectory};
pub use discovery::{DiscoveryMethod, PeerDiscovery};
pub use manager::NetworkManager;
pub use message::{Message, Opcode, Payload};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Dead,
    Alive,
}

/// Coarse role of a process in the cluster, fixed by configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    #[default]
    Server,
    Client,
    Monitor,
}

/// Election state machine role.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RaftRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Which of the two peer ports a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Raft,
    Replication,
}

/// Totally ordered replication log position.
///
/// `seq` is a counter the leader bumps for every entry it creates; `origin` is
/// a fingerprint of the node id that created the entry and only matters when
/// two leaders of disjoint partitions issued the same `seq`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogId {
    pub seq: u64,
    pub origin: u64,
}

impl LogId {
    pub const ZERO: LogId = LogId { seq: 0, origin: 0 };

    pub fn next(after: LogId, origin: u64) -> LogId {
        LogId {
            seq: after.seq + 1,
            origin,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == LogId::ZERO
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:x}", self.seq, self.origin)
    }
}

/// Stable 64-bit fingerprint of a node id, used as `LogId::origin`.
pub fn fingerprint(node_id: &str) -> u64 {
    let hash = blake3::hash(node_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

/// A peer's advertised state. Sent along with every message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub group: String,
    pub id: String,
    pub name: String,
    pub ip: IpAddr,
    pub raft_port: u16,
    pub repl_port: u16,
    pub status: NodeStatus,
    pub role: ClusterRole,
    pub raft_role: RaftRole,
    pub score: i64,
    pub score_count: u32,
    pub last_log_id: LogId,
    pub log_count: u64,
    pub last_service_log_id: u64,
    pub last_active_time: i64,
    pub version: String,
}

impl NodeInfo {
    /// Entry for a peer we only know the address of. Keyed by the address
    /// until a greeting tells us its real id.
    pub fn placeholder(group: &str, addr: SocketAddr, repl_port: u16) -> Self {
        Self {
            group: group.to_string(),
            id: addr.to_string(),
            name: String::new(),
            ip: addr.ip(),
            raft_port: addr.port(),
            repl_port,
            status: NodeStatus::Dead,
            role: ClusterRole::Server,
            raft_role: RaftRole::Follower,
            score: 0,
            score_count: 0,
            last_log_id: LogId::ZERO,
            log_count: 0,
            last_service_log_id: 0,
            last_active_time: 0,
            version: String::new(),
        }
    }

    pub fn raft_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.raft_port)
    }

    pub fn repl_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.repl_port)
    }

    pub fn addr(&self, channel: Channel) -> SocketAddr {
        match channel {
            Channel::Raft => self.raft_addr(),
            Channel::Replication => self.repl_addr(),
        }
    }

    /// Key a placeholder for this node would have been stored under.
    pub fn address_key(&self) -> String {
        self.raft_addr().to_string()
    }

    pub fn is_alive(&self) -> bool {
        self.status == NodeStatus::Alive
    }

    pub fn is_leader(&self) -> bool {
        self.raft_role == RaftRole::Leader
    }

    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// One replicated mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub id: LogId,
    pub action: LogAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogAction {
    Set(HashMap<String, String>),
    Remove(Vec<String>),
}

impl LogEntry {
    pub fn opcode(&self) -> Opcode {
        match self.action {
            LogAction::Set(_) => Opcode::ReplSet,
            LogAction::Remove(_) => Opcode::ReplRemove,
        }
    }
}

/// A named, typed collection of backend endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Loosely typed settings: `host/port/user/pass` for databases,
    /// `url/check` for web services.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Written by the leader's health checker; zero means unhealthy.
    #[serde(default = "default_status")]
    pub status: u32,
}

fn default_priority() -> u32 {
    1
}

fn default_status() -> u32 {
    1
}

impl Endpoint {
    pub fn new(attributes: BTreeMap<String, String>, priority: u32) -> Self {
        Self {
            attributes,
            priority,
            status: default_status(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn is_healthy(&self) -> bool {
        self.status != 0
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] storage::StorageError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Discovery failed: {0}")]
    Discovery(String),
}
