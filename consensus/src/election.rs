use std::cmp::Ordering;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::time::{interval, Instant};

use network::{Channel, ClusterRole, LogId, Message, NodeInfo, Opcode, Payload, RaftRole};

use crate::raft::RaftNode;
use crate::Result;

const ELECTION_TICK: Duration = Duration::from_millis(50);

/// Election precedence, highest first: log count, last log id, score
/// samples, accumulated score.
fn rank(info: &NodeInfo) -> (u64, LogId, u32, i64) {
    (info.log_count, info.last_log_id, info.score_count, info.score)
}

/// Whether `a` should lead rather than `b`. Full ties are a coin flip.
pub(crate) fn outranks<R: Rng + ?Sized>(a: &NodeInfo, b: &NodeInfo, rng: &mut R) -> bool {
    match rank(a).cmp(&rank(b)) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => rng.gen_bool(0.5),
    }
}

/// Like [`outranks`] but ties fall back to id order, so both sides of a
/// leader-vs-leader exchange reach the same verdict.
pub(crate) fn outranks_deterministic(a: &NodeInfo, b: &NodeInfo) -> bool {
    (rank(a), &a.id) > (rank(b), &b.id)
}

/// The leader announced by an `I_AM_LEADER` style reply.
pub(crate) fn claimed_leader(message: &Message) -> Option<NodeInfo> {
    match &message.body {
        Payload::Node(leader) => Some(leader.clone()),
        _ if message.info.is_leader() => Some(message.info.clone()),
        _ => None,
    }
}

impl RaftNode {
    pub(crate) async fn election_loop(&self) -> Result<()> {
        let mut ticker = interval(ELECTION_TICK);

        loop {
            ticker.tick().await;
            if !self.is_running() {
                return Ok(());
            }

            if let Err(e) = self.check_election_timeout().await {
                tracing::warn!("Election round failed: {}", e);
            }
        }
    }

    async fn check_election_timeout(&self) -> Result<()> {
        let known_leader = {
            let state = self.state.read().await;
            if state.is_leader() || !state.deadline_passed() {
                return Ok(());
            }
            state.leader.clone()
        };

        if let Some(leader) = known_leader {
            if self.leader_still_alive(&leader).await {
                let mut state = self.state.write().await;
                state.reset_deadline(self.config.election_window());
                return Ok(());
            }

            let mut state = self.state.write().await;
            if state.leader_id().as_deref() != Some(leader.id.as_str()) {
                return Ok(());
            }
            tracing::warn!("Leader {} timed out", leader.label());
            state.set_leader(None);
            drop(state);
            self.mark_dead(&leader, &"election timeout").await;
        }

        self.start_election().await
    }

    /// Asks a silent leader directly before giving up on it.
    async fn leader_still_alive(&self, leader: &NodeInfo) -> bool {
        match self
            .network
            .discovery()
            .say_hi(leader.raft_addr(), &self.local_info().await)
            .await
        {
            Ok(Some(info)) if info.id == leader.id && info.is_leader() => {
                self.network.peers().touch(info).await;
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn start_election(&self) -> Result<()> {
        let window = self.config.election_window();

        if self.identity.role != ClusterRole::Server {
            self.state.write().await.reset_deadline(window);
            return Ok(());
        }

        let alive = self.network.peers().alive_count().await;
        if alive + 1 < self.config.min_nodes {
            tracing::debug!(
                "Not enough live nodes for an election: {} < {}",
                alive + 1,
                self.config.min_nodes
            );
            self.state.write().await.reset_deadline(window);
            return Ok(());
        }

        {
            let mut state = self.state.write().await;
            if state.is_leader() || state.leader.is_some() {
                return Ok(());
            }
            state.set_role(RaftRole::Candidate);
            state.reset_score();
            state.reset_deadline(window);
        }

        if alive == 0 {
            self.become_leader().await;
            return Ok(());
        }

        if !self.begin_score().await? {
            let mut state = self.state.write().await;
            if state.raft_role == RaftRole::Candidate {
                tracing::debug!("Scoring round abandoned");
                state.set_role(RaftRole::Follower);
                state.reset_deadline(window);
            }
            return Ok(());
        }

        self.compare_scores().await
    }

    /// Measures round-trip latency to every live peer. Returns true only if
    /// every peer answered and none of them knows a leader.
    async fn begin_score(&self) -> Result<bool> {
        let peers = self.network.peers().alive().await;
        let request = Message::empty(Opcode::ScoreRequest, self.local_info().await);

        let mut pending: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let request = &request;
                async move {
                    let started = Instant::now();
                    let reply = self.network.request(peer, Channel::Raft, request).await;
                    (peer, reply, started.elapsed())
                }
            })
            .collect();

        while let Some((peer, reply, latency)) = pending.next().await {
            match reply {
                Ok(reply) => {
                    if reply.info.is_leader() && reply.info.id != self.identity.id {
                        tracing::info!("{} is leading, following it", peer.label());
                        self.follow(reply.info).await;
                        return Ok(false);
                    }
                    if reply.head == Opcode::IAmLeader {
                        if let Some(leader) = claimed_leader(&reply) {
                            if self.confirm_leader(&leader).await {
                                tracing::info!("{} reports leader {}", peer.label(), leader.label());
                                return Ok(false);
                            }
                            tracing::debug!(
                                "Ignoring leader {} reported by {}",
                                leader.label(),
                                peer.label()
                            );
                        }
                    }

                    self.network.peers().touch(reply.info).await;
                    let mut state = self.state.write().await;
                    if state.raft_role != RaftRole::Candidate {
                        return Ok(false);
                    }
                    state.score += latency.as_nanos() as i64;
                    state.score_count += 1;
                }
                Err(e) => self.mark_dead(peer, &e).await,
            }
        }

        let state = self.state.read().await;
        Ok(state.raft_role == RaftRole::Candidate && state.score_count as usize == peers.len())
    }

    async fn compare_scores(&self) -> Result<()> {
        let peers = self.network.peers().alive().await;
        let request = Message::empty(Opcode::ScoreCompareRequest, self.local_info().await);

        let replies = join_all(
            peers
                .iter()
                .map(|peer| self.network.request(peer, Channel::Raft, &request)),
        )
        .await;

        for (peer, reply) in peers.iter().zip(replies) {
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    self.mark_dead(peer, &e).await;
                    continue;
                }
            };

            match reply.head {
                Opcode::IAmLeader => {
                    let Some(leader) = claimed_leader(&reply) else {
                        continue;
                    };
                    if self.confirm_leader(&leader).await {
                        return Ok(());
                    }
                    tracing::debug!("Ignoring leader {} reported by {}", leader.label(), peer.label());
                }
                Opcode::ScoreCompareFailure => {
                    tracing::debug!("{} outranks us, standing down", peer.label());
                    let mut state = self.state.write().await;
                    if state.raft_role == RaftRole::Candidate {
                        state.set_role(RaftRole::Follower);
                        state.reset_deadline(self.config.election_window());
                    }
                    return Ok(());
                }
                Opcode::ScoreCompareSuccess => {}
                other => tracing::debug!("Unexpected {:?} from {} during comparison", other, peer.label()),
            }
        }

        if self.role().await == RaftRole::Candidate {
            self.become_leader().await;
        }
        Ok(())
    }

    /// Follows a leader named by someone else only once it answers a
    /// greeting as leader itself. Peers we already saw die are skipped.
    async fn confirm_leader(&self, claimed: &NodeInfo) -> bool {
        if claimed.id == self.identity.id || self.known_dead(&claimed.id).await {
            return false;
        }
        match self
            .network
            .discovery()
            .say_hi(claimed.raft_addr(), &self.local_info().await)
            .await
        {
            Ok(Some(info)) if info.id == claimed.id && info.is_leader() => {
                self.follow(info).await;
                true
            }
            _ => false,
        }
    }

    async fn known_dead(&self, id: &str) -> bool {
        self.network
            .peers()
            .get(id)
            .await
            .map(|p| !p.is_alive())
            .unwrap_or(false)
    }

    pub(crate) async fn become_leader(&self) {
        let me = {
            let mut state = self.state.write().await;
            if state.raft_role == RaftRole::Follower && state.leader.is_some() {
                return;
            }
            state.set_role(RaftRole::Leader);
            let me = self.info_from(&state);
            state.set_leader(Some(me.clone()));
            me
        };

        let announcement = Message::new(Opcode::IAmLeader, Payload::Node(me.clone()), me);
        for (peer, reply) in self.network.broadcast(Channel::Raft, &announcement).await {
            match reply {
                Ok(reply) => self.process_claim_reply(reply).await,
                Err(e) => self.mark_dead(&peer, &e).await,
            }
        }
    }

    /// `SCORE_REQUEST` responder: our info, or the leader we know of.
    pub(crate) async fn handle_score_request(&self, _message: Message) -> Message {
        let state = self.state.read().await;
        let me = self.info_from(&state);

        match self.current_leader(&state, &me) {
            Some(leader) => Message::new(Opcode::IAmLeader, Payload::Node(leader), me),
            None => Message::empty(Opcode::Response, me),
        }
    }

    /// `SCORE_COMPARE_REQUEST` responder. SUCCESS concedes to the requester,
    /// FAILURE tells it we rank higher.
    pub(crate) async fn handle_score_compare(&self, message: Message) -> Message {
        let mut state = self.state.write().await;
        let me = self.info_from(&state);

        if let Some(leader) = self.current_leader(&state, &me) {
            return Message::new(Opcode::IAmLeader, Payload::Node(leader), me);
        }

        let requester_wins = outranks(&message.info, &me, &mut rand::thread_rng());
        if requester_wins {
            if state.raft_role == RaftRole::Candidate {
                state.set_role(RaftRole::Follower);
            }
            state.reset_deadline(self.config.election_window());
            let me = self.info_from(&state);
            Message::empty(Opcode::ScoreCompareSuccess, me)
        } else {
            Message::empty(Opcode::ScoreCompareFailure, me)
        }
    }

    /// Ourselves if leading, or a leader we heard from recently.
    fn current_leader(&self, state: &crate::NodeState, me: &NodeInfo) -> Option<NodeInfo> {
        if state.is_leader() {
            return Some(me.clone());
        }
        match &state.leader {
            Some(leader) if !state.deadline_passed() => Some(leader.clone()),
            _ => None,
        }
    }
}
