use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;

use network::{
    Channel, DiscoveryMethod, Endpoint, Listener, Message, NetworkManager, NodeInfo, Opcode,
    Payload, RaftRole, Service,
};
use storage::{Codec, SnapshotStore};

use crate::handlers::{RaftHandler, ReplicationHandler};
use crate::raft::{Identity, RaftNode};
use crate::service::HealthCheck;
use crate::{Config, ConsensusError, LogAction, Result};

/// The node façade: owns the listeners and background loops, and exposes
/// the client operations. Mutations on a follower are forwarded to the
/// leader.
pub struct ConsensusManager {
    node: RaftNode,
    listeners: Arc<Mutex<Option<(Listener, Listener)>>>,
    shutdown: Arc<Notify>,
}

impl ConsensusManager {
    /// Binds both ports, restores the last snapshot and seeds the directory.
    /// Nothing runs until `start`.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let ip = resolve_local_ip(config.node_ip);
        let transport = config.transport_config();

        let raft_listener =
            Listener::bind(SocketAddr::new(config.node_ip, config.raft_port), transport.clone())
                .await?;
        let repl_listener =
            Listener::bind(SocketAddr::new(config.node_ip, config.repl_port), transport.clone())
                .await?;
        let raft_port = raft_listener.local_addr()?.port();
        let repl_port = repl_listener.local_addr()?.port();

        let identity = Identity::new(&config, ip, raft_port, repl_port);

        let mut methods = Vec::new();
        if !config.peers.is_empty() {
            methods.push(DiscoveryMethod::StaticPeers {
                peers: config.peers.clone(),
            });
        }
        if config.scan_subnet {
            methods.push(DiscoveryMethod::Subnet { port: raft_port });
        }
        let network = NetworkManager::new(transport, methods);

        let snapshots = SnapshotStore::new(
            config.snapshot_path(ip),
            Codec::new(crate::compression(config.snapshot_compression)),
        );

        tracing::info!(
            "Node {} ({}) in group {}: raft {}:{}, replication {}:{}",
            identity.id,
            identity.name,
            identity.group,
            ip,
            raft_port,
            ip,
            repl_port
        );

        let own_addr = identity.raft_addr();
        let node = RaftNode::new(identity, config.clone(), network, snapshots);

        for service in &config.services {
            node.services.set(service.clone()).await;
        }
        for addr in config.peers.iter().filter(|a| **a != own_addr) {
            let placeholder = NodeInfo::placeholder(&config.group, *addr, config.repl_port);
            node.network.peers().upsert(placeholder).await;
        }

        match node.restore().await {
            Ok(true) => {}
            Ok(false) => tracing::info!("No snapshot found, starting empty"),
            Err(e) => tracing::warn!("Failed to restore snapshot: {}", e),
        }

        Ok(Self {
            node,
            listeners: Arc::new(Mutex::new(Some((raft_listener, repl_listener)))),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Serves both ports and runs every background loop until `shutdown`
    /// is called or one of them fails.
    pub async fn start(&self) -> Result<()> {
        let (raft_listener, repl_listener) = self.listeners.lock().await.take().ok_or_else(|| {
            ConsensusError::InvalidMessage("Consensus manager already started".to_string())
        })?;

        tracing::info!("Starting consensus manager for node {}", self.node.id());

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let handler = Arc::new(RaftHandler::new(self.node.clone_for_task()));
        tasks.spawn(async move { Ok(raft_listener.serve(handler).await?) });

        let handler = Arc::new(ReplicationHandler::new(self.node.clone_for_task()));
        tasks.spawn(async move { Ok(repl_listener.serve(handler).await?) });

        let node = self.node.clone_for_task();
        tasks.spawn(async move { node.election_loop().await });
        let node = self.node.clone_for_task();
        tasks.spawn(async move { node.heartbeat_loop().await });
        let node = self.node.clone_for_task();
        tasks.spawn(async move { node.replication_loop().await });
        let node = self.node.clone_for_task();
        tasks.spawn(async move { node.log_trim_loop().await });
        let node = self.node.clone_for_task();
        tasks.spawn(async move { node.autosave_loop().await });
        let node = self.node.clone_for_task();
        tasks.spawn(async move { node.discovery_loop().await });
        let node = self.node.clone_for_task();
        tasks.spawn(async move { node.service_check_loop().await });

        let node = self.node.clone_for_task();
        tokio::spawn(async move {
            let peers = node.network.discovery().static_peers();
            if !peers.is_empty() {
                let reached = node.add_addresses(&peers).await;
                tracing::info!("Reached {} of {} configured peers", reached, peers.len());
            }
        });

        let result = tokio::select! {
            finished = tasks.join_next() => {
                self.node.stop();
                match finished {
                    Some(Ok(Ok(()))) | None => Ok(()),
                    Some(Ok(Err(e))) => {
                        tracing::error!("Consensus task failed: {}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        tracing::error!("Consensus task panicked: {}", e);
                        Err(ConsensusError::Task(e.to_string()))
                    }
                }
            }
            _ = self.shutdown.notified() => Ok(()),
        };

        tasks.shutdown().await;
        if let Err(e) = self.node.save().await {
            tracing::warn!("Final snapshot failed: {}", e);
        }
        tracing::info!("Consensus manager for node {} stopped", self.node.id());
        result
    }

    /// Stops the background loops; `start` returns once they are torn down.
    pub fn shutdown(&self) {
        self.node.stop();
        self.shutdown.notify_one();
    }

    pub fn id(&self) -> &str {
        self.node.id()
    }

    pub fn raft_addr(&self) -> SocketAddr {
        self.node.identity().raft_addr()
    }

    pub fn repl_addr(&self) -> SocketAddr {
        let identity = self.node.identity();
        SocketAddr::new(identity.ip, identity.repl_port)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.node.kv.get(key).await
    }

    pub async fn entries(&self) -> HashMap<String, String> {
        self.node.kv.snapshot().await
    }

    /// Commits once every live follower has acknowledged, or forwards to the
    /// leader when this node is a follower.
    pub async fn set(&self, items: HashMap<String, String>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        if self.node.is_leader().await {
            match self.node.propose(LogAction::Set(items.clone())).await {
                Err(ConsensusError::NotLeader(_)) => {}
                other => return other.map(|_| ()),
            }
        }
        self.forward(Opcode::ReplSet, Payload::Items(items)).await
    }

    pub async fn remove(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if self.node.is_leader().await {
            match self.node.propose(LogAction::Remove(keys.clone())).await {
                Err(ConsensusError::NotLeader(_)) => {}
                other => return other.map(|_| ()),
            }
        }
        self.forward(Opcode::ReplRemove, Payload::Keys(keys)).await
    }

    pub async fn list_peers(&self) -> Vec<NodeInfo> {
        self.node.network.peers().all().await
    }

    /// Greets each address locally and, on a follower, asks the leader to do
    /// the same. Returns how many addresses answered here.
    pub async fn add_peers(&self, addrs: Vec<String>) -> Result<usize> {
        let parsed = self.node.parse_addresses(&addrs)?;
        let reached = self.node.add_addresses(&parsed).await;

        if !self.node.is_leader().await && self.node.leader().await.is_some() {
            if let Err(e) = self.forward(Opcode::PeersAdd, Payload::Addresses(addrs)).await {
                tracing::warn!("Leader did not take the new peers: {}", e);
            }
        }
        Ok(reached)
    }

    /// On the leader, removes and tells every peer to do the same. On a
    /// follower, removes locally and forwards to the leader.
    pub async fn remove_peers(&self, addrs: Vec<String>) -> Result<usize> {
        let removed = self.node.remove_addresses(&addrs).await;

        if self.node.is_leader().await {
            self.node.fan_out_removal(&addrs).await;
        } else if self.node.leader().await.is_some() {
            self.forward(Opcode::PeersRemove, Payload::Addresses(addrs)).await?;
        }
        Ok(removed)
    }

    pub async fn get_service(&self, name: &str) -> Option<Service> {
        self.node.services.get(name).await
    }

    pub async fn services(&self) -> HashMap<String, Service> {
        self.node.services.all().await
    }

    pub async fn set_service(&self, service: Service) -> Result<()> {
        if self.node.is_leader().await {
            match self.node.set_service_local(service.clone()).await {
                Err(ConsensusError::NotLeader(_)) => {}
                other => return other,
            }
        }
        self.forward(Opcode::ServiceSet, Payload::Service(service)).await
    }

    pub async fn remove_service(&self, name: &str) -> Result<()> {
        let names = vec![name.to_string()];
        if self.node.is_leader().await {
            match self.node.remove_service_local(&names).await {
                Ok(0) => return Err(ConsensusError::ServiceNotFound(name.to_string())),
                Err(ConsensusError::NotLeader(_)) => {}
                other => return other.map(|_| ()),
            }
        }
        self.forward(Opcode::ServiceRemove, Payload::Names(names)).await
    }

    /// Weighted pick among the healthy endpoints of `name`.
    pub async fn select_service_endpoint(&self, name: &str) -> Result<Endpoint> {
        self.node.services.select(name).await
    }

    /// Uses `check` for services of type `kind` from the next check round.
    pub async fn register_health_check(&self, kind: &str, check: Arc<dyn HealthCheck>) {
        self.node.checker.register(kind, check).await;
    }

    pub async fn is_leader(&self) -> bool {
        self.node.is_leader().await
    }

    pub async fn get_leader(&self) -> Option<NodeInfo> {
        self.node.leader().await
    }

    pub async fn role(&self) -> RaftRole {
        self.node.role().await
    }

    pub async fn local_info(&self) -> NodeInfo {
        self.node.local_info().await
    }

    pub async fn save(&self) -> Result<()> {
        self.node.save().await
    }

    /// Sends a client request to the leader's replication port.
    async fn forward(&self, head: Opcode, body: Payload) -> Result<()> {
        let leader = self.node.leader().await.ok_or(ConsensusError::NoLeader)?;
        if leader.id == self.node.id() {
            return Err(ConsensusError::NotLeader(None));
        }

        let message = Message::new(head, body, self.node.local_info().await);
        tracing::debug!("Forwarding {:?} to leader {}", head, leader.label());

        let reply = self
            .node
            .network
            .request(&leader, Channel::Replication, &message)
            .await
            .map_err(|e| ConsensusError::LeaderUnreachable(format!("{}: {}", leader.label(), e)))?;

        match reply.error() {
            Some(error) => Err(ConsensusError::Rejected(error.to_string())),
            None => Ok(()),
        }
    }
}

/// Picks the address to advertise. An unspecified address is replaced by the
/// one the OS would route outbound traffic from.
fn resolve_local_ip(configured: IpAddr) -> IpAddr {
    if !configured.is_unspecified() {
        return configured;
    }
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
