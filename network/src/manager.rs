use futures::future::join_all;

use crate::communication::{Connection, Transport, TransportConfig};
use crate::directory::PeerDirectory;
use crate::discovery::{DiscoveryMethod, PeerDiscovery};
use crate::{Channel, Message, NodeInfo, Result};

/// Bundles the transport, the peer directory and discovery for a node.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    transport: Transport,
    peers: PeerDirectory,
    discovery: PeerDiscovery,
}

impl NetworkManager {
    pub fn new(config: TransportConfig, methods: Vec<DiscoveryMethod>) -> Self {
        let transport = Transport::new(config);
        let discovery = PeerDiscovery::new(transport.clone(), methods);

        Self {
            transport,
            peers: PeerDirectory::new(),
            discovery,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn discovery(&self) -> &PeerDiscovery {
        &self.discovery
    }

    pub async fn connect(&self, peer: &NodeInfo, channel: Channel) -> Result<Connection> {
        self.transport.connect(peer.addr(channel)).await
    }

    pub async fn request(&self, peer: &NodeInfo, channel: Channel, message: &Message) -> Result<Message> {
        tracing::trace!("Sending {:?} to {} on {:?}", message.head, peer.label(), channel);
        self.transport.request(peer.addr(channel), message).await
    }

    /// Sends `message` to every live peer at once and collects the replies.
    pub async fn broadcast(
        &self,
        channel: Channel,
        message: &Message,
    ) -> Vec<(NodeInfo, Result<Message>)> {
        let peers = self.peers.alive().await;
        let requests = peers.iter().map(|peer| self.request(peer, channel, message));
        let replies = join_all(requests).await;
        peers.into_iter().zip(replies).collect()
    }
}
