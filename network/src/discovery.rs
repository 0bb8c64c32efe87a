use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures::stream::{self, StreamExt};

use crate::{Message, NetworkError, NodeInfo, Opcode, Result, Transport};

const SCAN_CONCURRENCY: usize = 64;

#[derive(Debug, Clone)]
pub enum DiscoveryMethod {
    /// Addresses given on the command line or in the config file.
    StaticPeers { peers: Vec<SocketAddr> },
    /// Every host of the local /24 on the raft port.
    Subnet { port: u16 },
}

/// Finds peers by greeting candidate addresses with `HI`.
#[derive(Debug, Clone)]
pub struct PeerDiscovery {
    transport: Transport,
    methods: Vec<DiscoveryMethod>,
}

impl PeerDiscovery {
    pub fn new(transport: Transport, methods: Vec<DiscoveryMethod>) -> Self {
        Self { transport, methods }
    }

    pub fn methods(&self) -> &[DiscoveryMethod] {
        &self.methods
    }

    pub fn static_peers(&self) -> Vec<SocketAddr> {
        self.methods
            .iter()
            .filter_map(|m| match m {
                DiscoveryMethod::StaticPeers { peers } => Some(peers.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Candidate addresses for this round, without duplicates and without
    /// our own raft address.
    pub fn targets(&self, local: SocketAddr) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for method in &self.methods {
            let addrs = match method {
                DiscoveryMethod::StaticPeers { peers } => peers.clone(),
                DiscoveryMethod::Subnet { port } => subnet_hosts(local.ip(), *port),
            };
            for addr in addrs {
                if addr != local && seen.insert(addr) {
                    targets.push(addr);
                }
            }
        }

        targets
    }

    /// Greets one address. Returns `None` when the answer came from ourselves,
    /// which happens when a configured peer address loops back to this node.
    pub async fn say_hi(&self, addr: SocketAddr, local: &NodeInfo) -> Result<Option<NodeInfo>> {
        let mut conn = self.transport.connect_once(addr).await?;
        let reply = conn.call(&Message::empty(Opcode::Hi, local.clone())).await?;

        if reply.head != Opcode::HiAck {
            return Err(NetworkError::Protocol(format!(
                "unexpected reply {:?} to HI from {}",
                reply.head, addr
            )));
        }
        if reply.info.id == local.id {
            tracing::debug!("Address {} is this node, skipping", addr);
            return Ok(None);
        }

        Ok(Some(reply.info))
    }

    /// Greets every target plus `extra` concurrently and returns the peers
    /// that answered.
    pub async fn discover(&self, local: &NodeInfo, extra: &[SocketAddr]) -> Vec<NodeInfo> {
        let mut targets = self.targets(local.raft_addr());
        for addr in extra {
            if *addr != local.raft_addr() && !targets.contains(addr) {
                targets.push(*addr);
            }
        }
        tracing::debug!("Greeting {} candidate peers", targets.len());

        stream::iter(targets)
            .map(|addr| async move {
                match self.say_hi(addr, local).await {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::trace!("No answer from {}: {}", addr, e);
                        None
                    }
                }
            })
            .buffer_unordered(SCAN_CONCURRENCY)
            .filter_map(|found| async move { found })
            .collect()
            .await
    }
}

fn subnet_hosts(ip: IpAddr, port: u16) -> Vec<SocketAddr> {
    match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => {
            let [a, b, c, _] = v4.octets();
            (1..=254u8)
                .map(|d| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port))
                .collect()
        }
        _ => Vec::new(),
    }
}
