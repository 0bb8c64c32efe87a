use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};

use network::{
    fingerprint, now_millis, ClusterRole, NetworkManager, NodeInfo, NodeStatus, RaftRole, VERSION,
};
use storage::{KvStore, SnapshotStore};

use crate::log::ReplicationLog;
use crate::service::{HealthChecker, ServiceRegistry};
use crate::state::NodeState;
use crate::Config;

/// Who this node is. Fixed once the listeners are bound.
#[derive(Debug, Clone)]
pub struct Identity {
    pub group: String,
    pub id: String,
    pub name: String,
    pub ip: IpAddr,
    pub raft_port: u16,
    pub repl_port: u16,
    pub role: ClusterRole,
    /// Fingerprint stamped into every log id this node issues.
    pub origin: u64,
}

impl Identity {
    pub fn new(config: &Config, ip: IpAddr, raft_port: u16, repl_port: u16) -> Self {
        let id = config
            .node_id
            .clone()
            .unwrap_or_else(|| derive_node_id(ip, raft_port));
        let name = if config.node_name.is_empty() {
            hostname().unwrap_or_else(|| id.clone())
        } else {
            config.node_name.clone()
        };

        Self {
            group: config.group.clone(),
            origin: fingerprint(&id),
            id,
            name,
            ip,
            raft_port,
            repl_port,
            role: config.role,
        }
    }

    pub fn raft_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.raft_port)
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Stable id from the hostname and the host's addresses, so a node keeps its
/// identity when one interface changes. The raft port separates several
/// nodes sharing a host.
pub fn derive_node_id(ip: IpAddr, raft_port: u16) -> String {
    let host = hostname().unwrap_or_default();

    let mut ips: Vec<IpAddr> = std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), 0))
        .map(|addrs| addrs.map(|a| a.ip()).collect())
        .unwrap_or_default();
    ips.push(ip);
    ips.sort();
    ips.dedup();

    let mut hasher = blake3::Hasher::new();
    hasher.update(host.as_bytes());
    for ip in &ips {
        hasher.update(ip.to_string().as_bytes());
    }
    hasher.update(&raft_port.to_be_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// Tracks which per-peer tasks are running and under which epoch.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, u64>>>,
}

impl TaskRegistry {
    /// Returns true if the caller should start a task for `peer`.
    pub async fn claim(&self, peer: &str, epoch: u64) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.get(peer) {
            Some(running) if *running == epoch => false,
            _ => {
                tasks.insert(peer.to_string(), epoch);
                true
            }
        }
    }

    pub async fn release(&self, peer: &str, epoch: u64) {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(peer) == Some(&epoch) {
            tasks.remove(peer);
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

pub struct RaftNode {
    pub(crate) identity: Arc<Identity>,
    pub(crate) state: Arc<RwLock<NodeState>>,
    pub(crate) network: NetworkManager,
    pub(crate) log: ReplicationLog,
    pub(crate) kv: KvStore,
    pub(crate) services: ServiceRegistry,
    pub(crate) checker: Arc<HealthChecker>,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) config: Arc<Config>,
    /// Serializes log entry creation on the leader.
    pub(crate) proposals: Arc<Mutex<()>>,
    pub(crate) heartbeats: TaskRegistry,
    pub(crate) replicators: TaskRegistry,
    /// Claimants currently under split-brain resolution.
    pub(crate) resolving: Arc<Mutex<HashSet<String>>>,
    pub(crate) save_signal: Arc<Notify>,
    pub(crate) running: Arc<AtomicBool>,
}

impl RaftNode {
    pub fn new(
        identity: Identity,
        config: Config,
        network: NetworkManager,
        snapshots: SnapshotStore,
    ) -> Self {
        let state = NodeState::new(config.election_window());
        let checker = HealthChecker::new(std::time::Duration::from_millis(config.tcp_timeout_ms));

        Self {
            identity: Arc::new(identity),
            state: Arc::new(RwLock::new(state)),
            network,
            log: ReplicationLog::new(),
            kv: KvStore::new(),
            services: ServiceRegistry::new(),
            checker: Arc::new(checker),
            snapshots: Arc::new(snapshots),
            config: Arc::new(config),
            proposals: Arc::new(Mutex::new(())),
            heartbeats: TaskRegistry::default(),
            replicators: TaskRegistry::default(),
            resolving: Arc::new(Mutex::new(HashSet::new())),
            save_signal: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Our own advertised state, built under the caller's state lock.
    pub(crate) fn info_from(&self, state: &NodeState) -> NodeInfo {
        NodeInfo {
            group: self.identity.group.clone(),
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            ip: self.identity.ip,
            raft_port: self.identity.raft_port,
            repl_port: self.identity.repl_port,
            status: NodeStatus::Alive,
            role: self.identity.role,
            raft_role: state.raft_role,
            score: state.score,
            score_count: state.score_count,
            last_log_id: state.last_log_id,
            log_count: state.log_count,
            last_service_log_id: state.last_service_log_id,
            last_active_time: now_millis(),
            version: VERSION.to_string(),
        }
    }

    pub async fn local_info(&self) -> NodeInfo {
        let state = self.state.read().await;
        self.info_from(&state)
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.is_leader()
    }

    pub async fn leader(&self) -> Option<NodeInfo> {
        let state = self.state.read().await;
        if state.is_leader() {
            Some(self.info_from(&state))
        } else {
            state.leader.clone()
        }
    }

    pub async fn role(&self) -> RaftRole {
        self.state.read().await.raft_role
    }

    /// True while we are leader under the given epoch.
    pub(crate) async fn leads_in(&self, epoch: u64) -> bool {
        let state = self.state.read().await;
        state.is_leader() && state.epoch == epoch
    }

    /// Becomes a follower of `leader` and greets it if it is new to us.
    pub(crate) async fn follow(&self, leader: NodeInfo) {
        if leader.id == self.identity.id {
            return;
        }
        let changed = {
            let mut state = self.state.write().await;
            state.adopt_leader(leader.clone(), self.config.election_window())
        };
        self.after_adopt(leader, changed).await;
    }

    /// Bookkeeping once a leader was adopted under the state lock.
    pub(crate) async fn after_adopt(&self, leader: NodeInfo, changed: bool) {
        self.network.peers().touch(leader.clone()).await;
        if changed {
            let node = self.clone_for_task();
            tokio::spawn(async move {
                if let Err(e) = node.greet(leader.raft_addr()).await {
                    tracing::debug!("Failed to greet leader {}: {}", leader.label(), e);
                }
            });
        }
    }

    pub(crate) async fn mark_dead(&self, peer: &NodeInfo, reason: &(dyn std::fmt::Display + Sync)) {
        if self.network.peers().set_status(&peer.id, NodeStatus::Dead).await {
            tracing::warn!("Peer {} marked dead: {}", peer.label(), reason);
        }
    }

    pub(crate) fn clone_for_task(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            state: self.state.clone(),
            network: self.network.clone(),
            log: self.log.clone(),
            kv: self.kv.clone(),
            services: self.services.clone(),
            checker: self.checker.clone(),
            snapshots: self.snapshots.clone(),
            config: self.config.clone(),
            proposals: self.proposals.clone(),
            heartbeats: self.heartbeats.clone(),
            replicators: self.replicators.clone(),
            resolving: self.resolving.clone(),
            save_signal: self.save_signal.clone(),
            running: self.running.clone(),
        }
    }
}
