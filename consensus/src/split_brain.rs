use network::{Channel, Message, NodeInfo, Opcode, Payload};

use crate::election::outranks_deterministic;
use crate::raft::RaftNode;

impl RaftNode {
    /// We follow `current` but `claimant` also says it leads. Ask `current`
    /// to probe `claimant` and settle on one of them.
    pub(crate) async fn resolve_split_brain(&self, current: NodeInfo, claimant: NodeInfo) {
        {
            let mut resolving = self.resolving.lock().await;
            if !resolving.insert(claimant.id.clone()) {
                return;
            }
        }

        tracing::info!(
            "Split brain: following {} but {} claims leadership",
            current.label(),
            claimant.label()
        );
        self.check_with_leader(&current, &claimant).await;

        self.resolving.lock().await.remove(&claimant.id);
    }

    async fn check_with_leader(&self, current: &NodeInfo, claimant: &NodeInfo) {
        let check = Message::new(
            Opcode::SplitBrainCheck,
            Payload::Node(claimant.clone()),
            self.local_info().await,
        );

        let reply = match self.network.request(current, Channel::Raft, &check).await {
            Ok(reply) => reply,
            Err(e) => {
                self.mark_dead(current, &e).await;
                self.follow(claimant.clone()).await;
                return;
            }
        };

        match reply.body {
            Payload::Verdict {
                reachable: false, ..
            } => {
                // Disjoint partitions. Keep the current leader unless its log
                // is behind, and have it forget the claimant either way.
                let ours = (reply.info.log_count, reply.info.last_log_id);
                let theirs = (claimant.log_count, claimant.last_log_id);
                if ours < theirs {
                    tracing::info!("{} has the newer log, switching", claimant.label());
                    self.follow(claimant.clone()).await;
                }

                let unset = Message::new(
                    Opcode::SplitBrainUnset,
                    Payload::Node(claimant.clone()),
                    self.local_info().await,
                );
                if let Err(e) = self.network.request(current, Channel::Raft, &unset).await {
                    tracing::debug!("Failed to send unset to {}: {}", current.label(), e);
                }
            }
            Payload::Verdict {
                reachable: true,
                leader: Some(winner),
            } => {
                if winner.id != self.identity.id {
                    self.follow(winner).await;
                }
            }
            other => tracing::debug!("Unexpected split brain verdict: {:?}", other),
        }
    }

    /// SPLIT_BRAIN_CHECK on the leader we follow: can we see the claimant,
    /// and who wins if so.
    pub(crate) async fn handle_split_brain_check(&self, message: Message) -> Message {
        let me = self.local_info().await;
        let Payload::Node(claimant) = message.body else {
            return Message::new(Opcode::Response, Payload::Error("expected a node".to_string()), me);
        };

        if !me.is_leader() {
            let leader = self.state.read().await.leader.clone();
            let verdict = Payload::Verdict {
                reachable: leader.is_some(),
                leader,
            };
            return Message::new(Opcode::Response, verdict, me);
        }

        let probe = self.network.discovery().say_hi(claimant.raft_addr(), &me).await;
        let other = match probe {
            Ok(Some(info)) => info,
            _ => {
                tracing::info!("Claimant {} is unreachable from here", claimant.label());
                let verdict = Payload::Verdict {
                    reachable: false,
                    leader: None,
                };
                return Message::new(Opcode::Response, verdict, me);
            }
        };
        self.network.peers().touch(other.clone()).await;

        if !other.is_leader() || outranks_deterministic(&me, &other) {
            let claim = Message::new(Opcode::IAmLeader, Payload::Node(me.clone()), me.clone());
            match self.network.request(&other, Channel::Raft, &claim).await {
                Ok(reply) => self.process_claim_reply(reply).await,
                Err(e) => tracing::debug!("Failed to notify {}: {}", other.label(), e),
            }
        } else {
            tracing::info!("{} outranks us, following it", other.label());
            self.follow(other).await;
        }

        let me = self.local_info().await;
        let winner = self.leader().await;
        let verdict = Payload::Verdict {
            reachable: true,
            leader: winner,
        };
        Message::new(Opcode::Response, verdict, me)
    }

    /// SPLIT_BRAIN_UNSET: a follower decided the claimant is unreachable.
    pub(crate) async fn handle_split_brain_unset(&self, message: Message) -> Message {
        if let Payload::Node(claimant) = &message.body {
            if self.network.peers().remove(&claimant.id).await.is_some() {
                tracing::info!("Removed unreachable claimant {}", claimant.label());
            }
        }
        Message::empty(Opcode::Response, self.local_info().await)
    }
}
