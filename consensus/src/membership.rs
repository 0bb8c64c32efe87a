use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::interval;

use network::{Message, NodeInfo, Opcode, Payload};

use crate::raft::RaftNode;
use crate::Result;

impl RaftNode {
    /// Re-greets static peers, dead peers and, when enabled, the subnet.
    pub(crate) async fn discovery_loop(&self) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.config.discovery_interval_ms));

        loop {
            ticker.tick().await;
            if !self.is_running() {
                return Ok(());
            }

            let found = self.discover_peers().await;
            if found > 0 {
                tracing::debug!("Discovery round reached {} peers", found);
            }

            for id in self
                .network
                .peers()
                .evict_dead(self.config.dead_peer_eviction_ms)
                .await
            {
                tracing::info!("Evicted long-dead peer {}", id);
            }
        }
    }

    pub(crate) async fn discover_peers(&self) -> usize {
        let me = self.local_info().await;
        let dead: Vec<SocketAddr> = self
            .network
            .peers()
            .all()
            .await
            .into_iter()
            .filter(|p| !p.is_alive())
            .map(|p| p.raft_addr())
            .collect();

        let found = self.network.discovery().discover(&me, &dead).await;
        let count = found.len();
        for info in found {
            self.network.peers().touch(info).await;
        }
        count
    }

    /// Greets one address and records whoever answers.
    pub(crate) async fn greet(&self, addr: SocketAddr) -> Result<Option<NodeInfo>> {
        let me = self.local_info().await;
        let found = self.network.discovery().say_hi(addr, &me).await?;
        if let Some(info) = &found {
            tracing::debug!("Greeted {} at {}", info.label(), addr);
            self.network.peers().touch(info.clone()).await;
        }
        Ok(found)
    }

    /// Greets each address; unreachable ones are kept as dead placeholders
    /// for discovery to retry.
    pub(crate) async fn add_addresses(&self, addrs: &[SocketAddr]) -> usize {
        let mut reached = 0;
        for addr in addrs {
            if *addr == self.identity.raft_addr() {
                continue;
            }
            match self.greet(*addr).await {
                Ok(Some(_)) => reached += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::info!("Peer {} not reachable yet: {}", addr, e);
                    let placeholder =
                        NodeInfo::placeholder(&self.identity.group, *addr, self.config.repl_port);
                    if !self.network.peers().contains(&placeholder.id).await {
                        self.network.peers().upsert(placeholder).await;
                    }
                }
            }
        }
        reached
    }

    pub(crate) async fn remove_addresses(&self, addrs: &[String]) -> usize {
        let mut removed = 0;
        for addr in addrs {
            for peer in self.network.peers().remove_by_address(addr).await {
                tracing::info!("Removed peer {} ({})", peer.label(), addr);
                removed += 1;
            }
        }
        removed
    }

    /// HI: answer with who we are.
    pub(crate) async fn handle_hi(&self, message: Message) -> Message {
        let me = self.local_info().await;
        if message.info.id != me.id {
            tracing::debug!("Hi from {}", message.info.label());
        }
        Message::empty(Opcode::HiAck, me)
    }

    /// PEERS_ADD / PEERS_REMOVE forwarded by a follower, or PEERS_REMOVE fanned
    /// out by the leader.
    pub(crate) async fn handle_peers_change(&self, message: Message) -> Message {
        let Payload::Addresses(addrs) = message.body else {
            return self.error_reply("expected addresses").await;
        };

        match message.head {
            Opcode::PeersAdd => {
                let parsed = match self.parse_addresses(&addrs) {
                    Ok(parsed) => parsed,
                    Err(e) => return self.error_reply(&e.to_string()).await,
                };
                self.add_addresses(&parsed).await;
            }
            Opcode::PeersRemove => {
                self.remove_addresses(&addrs).await;
                if self.is_leader().await {
                    self.fan_out_removal(&addrs).await;
                }
            }
            _ => return self.error_reply("unexpected opcode").await,
        }
        Message::empty(Opcode::Response, self.local_info().await)
    }

    pub(crate) async fn fan_out_removal(&self, addrs: &[String]) {
        let message = Message::new(
            Opcode::PeersRemove,
            Payload::Addresses(addrs.to_vec()),
            self.local_info().await,
        );
        for (peer, reply) in self
            .network
            .broadcast(network::Channel::Replication, &message)
            .await
        {
            if let Err(e) = reply {
                tracing::debug!("Failed to forward peer removal to {}: {}", peer.label(), e);
            }
        }
    }

    pub(crate) fn parse_addresses(&self, addrs: &[String]) -> Result<Vec<SocketAddr>> {
        addrs
            .iter()
            .map(|a| crate::parse_peer_addr(a, self.config.raft_port))
            .collect()
    }
}
