use async_trait::async_trait;

use network::{Connection, Message, MessageHandler, Opcode, Payload};

use crate::raft::RaftNode;

/// Dispatcher for the raft port: greetings, elections, heartbeats.
pub(crate) struct RaftHandler {
    node: RaftNode,
}

impl RaftHandler {
    pub fn new(node: RaftNode) -> Self {
        Self { node }
    }
}

#[async_trait]
impl MessageHandler for RaftHandler {
    async fn handle(&self, conn: &mut Connection, message: Message) -> network::Result<()> {
        let node = &self.node;
        if message.info.id != node.identity.id {
            node.network.peers().touch(message.info.clone()).await;
        }

        let reply = match message.head {
            Opcode::Hi => node.handle_hi(message).await,
            Opcode::Heartbeat | Opcode::IAmLeader => node.handle_leader_claim(message).await,
            Opcode::SplitBrainCheck => node.handle_split_brain_check(message).await,
            Opcode::SplitBrainUnset => node.handle_split_brain_unset(message).await,
            Opcode::ScoreRequest => node.handle_score_request(message).await,
            Opcode::ScoreCompareRequest => node.handle_score_compare(message).await,
            other => {
                tracing::debug!("Ignoring {:?} on the raft port", other);
                return Ok(());
            }
        };

        conn.send(&reply).await
    }
}

/// Dispatcher for the replication port: log entries, resync, forwarded
/// client mutations, peer and service changes.
pub(crate) struct ReplicationHandler {
    node: RaftNode,
}

impl ReplicationHandler {
    pub fn new(node: RaftNode) -> Self {
        Self { node }
    }
}

#[async_trait]
impl MessageHandler for ReplicationHandler {
    async fn handle(&self, conn: &mut Connection, message: Message) -> network::Result<()> {
        let node = &self.node;
        let from_leader = matches!(message.body, Payload::Entry(_));

        let reply = match message.head {
            Opcode::Response => return Ok(()),
            Opcode::ReplSet | Opcode::ReplRemove if from_leader => node.handle_entry(message).await,
            Opcode::ReplSet | Opcode::ReplRemove => node.handle_client_mutation(message).await,
            Opcode::ReplHeartbeat => {
                return match node.handle_repl_heartbeat(conn, message).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        tracing::debug!("Replication heartbeat exchange failed: {}", e);
                        Err(network::NetworkError::Protocol(e.to_string()))
                    }
                };
            }
            Opcode::ReplIncrementalUpdate | Opcode::ReplCompleteUpdate | Opcode::ServiceUpdate => {
                match node.apply_update(message).await {
                    Ok(()) => Message::empty(Opcode::Response, node.local_info().await),
                    Err(e) => node.error_reply(&e.to_string()).await,
                }
            }
            Opcode::ReplPeersUpdate => node.handle_peers_update(message).await,
            Opcode::PeersAdd | Opcode::PeersRemove => node.handle_peers_change(message).await,
            Opcode::ServiceSet | Opcode::ServiceRemove => node.handle_service_change(message).await,
            other => {
                tracing::debug!("Ignoring {:?} on the replication port", other);
                return Ok(());
            }
        };

        conn.send(&reply).await
    }
}
