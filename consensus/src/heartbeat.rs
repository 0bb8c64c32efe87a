use tokio::time::{interval, sleep};

use network::{Channel, Message, Opcode, Payload, RaftRole};

use crate::election::{claimed_leader, outranks_deterministic};
use crate::raft::RaftNode;
use crate::Result;

impl RaftNode {
    /// Leader only: keeps one heartbeat task running per live peer.
    pub(crate) async fn heartbeat_loop(&self) -> Result<()> {
        let mut ticker = interval(self.config.heartbeat_interval());

        loop {
            ticker.tick().await;
            if !self.is_running() {
                return Ok(());
            }

            let epoch = {
                let state = self.state.read().await;
                if !state.is_leader() {
                    continue;
                }
                state.epoch
            };

            for peer in self.network.peers().alive().await {
                if self.heartbeats.claim(&peer.id, epoch).await {
                    let node = self.clone_for_task();
                    tokio::spawn(async move {
                        node.heartbeat_peer(peer.id.clone(), epoch).await;
                        node.heartbeats.release(&peer.id, epoch).await;
                    });
                }
            }
        }
    }

    async fn heartbeat_peer(&self, peer_id: String, epoch: u64) {
        tracing::debug!("Heartbeat task for {} started (epoch {})", peer_id, epoch);

        loop {
            if !self.is_running() || !self.leads_in(epoch).await {
                break;
            }
            let Some(peer) = self.network.peers().get(&peer_id).await else {
                break;
            };
            if !peer.is_alive() {
                break;
            }

            let message = Message::empty(Opcode::Heartbeat, self.local_info().await);
            match self.network.request(&peer, Channel::Raft, &message).await {
                Ok(reply) => self.process_claim_reply(reply).await,
                Err(e) => {
                    self.mark_dead(&peer, &e).await;
                    let evicted = self
                        .network
                        .peers()
                        .evict_dead(self.config.dead_peer_eviction_ms)
                        .await;
                    for id in evicted {
                        tracing::info!("Evicted long-dead peer {}", id);
                    }
                    break;
                }
            }

            sleep(self.config.heartbeat_interval()).await;
        }

        tracing::debug!("Heartbeat task for {} stopped", peer_id);
    }

    /// Reply to our HEARTBEAT or I_AM_LEADER. A peer answering I_AM_LEADER
    /// with someone else outranked us, so we follow that leader.
    pub(crate) async fn process_claim_reply(&self, reply: Message) {
        if reply.head == Opcode::IAmLeader {
            if let Some(leader) = claimed_leader(&reply) {
                if leader.id != self.identity.id {
                    tracing::info!("Stepping down in favour of {}", leader.label());
                    self.follow(leader).await;
                    return;
                }
            }
        }
        if reply.info.id != self.identity.id {
            self.network.peers().touch(reply.info).await;
        }
    }

    /// Handles HEARTBEAT and I_AM_LEADER: someone claims to lead the cluster.
    pub(crate) async fn handle_leader_claim(&self, message: Message) -> Message {
        let claimant = match message.head {
            Opcode::IAmLeader => claimed_leader(&message).unwrap_or_else(|| message.info.clone()),
            _ => message.info.clone(),
        };
        let window = self.config.election_window();

        let mut state = self.state.write().await;
        let me = self.info_from(&state);

        if claimant.id == me.id {
            return Message::empty(Opcode::Response, me);
        }

        if state.is_leader() {
            if outranks_deterministic(&claimant, &me) {
                tracing::info!("Leader {} outranks us, demoting", claimant.label());
                let changed = state.adopt_leader(claimant.clone(), window);
                let me = self.info_from(&state);
                drop(state);
                self.after_adopt(claimant, changed).await;
                return Message::empty(Opcode::Response, me);
            }
            return Message::new(Opcode::IAmLeader, Payload::Node(me.clone()), me);
        }

        let current = state.leader.clone();
        match current {
            None => {
                let changed = state.adopt_leader(claimant.clone(), window);
                let me = self.info_from(&state);
                drop(state);
                self.after_adopt(claimant, changed).await;
                Message::empty(Opcode::Response, me)
            }
            Some(_) if state.raft_role == RaftRole::Candidate => {
                let changed = state.adopt_leader(claimant.clone(), window);
                let me = self.info_from(&state);
                drop(state);
                self.after_adopt(claimant, changed).await;
                Message::empty(Opcode::Response, me)
            }
            Some(leader) if leader.id == claimant.id => {
                state.leader = Some(claimant.clone());
                state.reset_deadline(window);
                drop(state);
                self.network.peers().touch(claimant).await;
                Message::empty(Opcode::Response, me)
            }
            Some(leader) => {
                if state.deadline_passed() {
                    let changed = state.adopt_leader(claimant.clone(), window);
                    let me = self.info_from(&state);
                    drop(state);
                    self.after_adopt(claimant, changed).await;
                    return Message::empty(Opcode::Response, me);
                }
                drop(state);

                let node = self.clone_for_task();
                tokio::spawn(async move {
                    node.resolve_split_brain(leader, claimant).await;
                });
                Message::empty(Opcode::Response, me)
            }
        }
    }
}
