use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use network::{LogId, NodeInfo, RaftRole};

/// The node's own mutable state. Lives behind a single lock so role, leader
/// and score changes are always observed together.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub raft_role: RaftRole,
    pub leader: Option<NodeInfo>,
    pub score: i64,
    pub score_count: u32,
    pub election_deadline: Instant,
    /// Bumped on every role change; per-peer tasks carry the epoch they were
    /// spawned under and stop once it moves on.
    pub epoch: u64,
    pub last_log_id: LogId,
    pub log_count: u64,
    pub last_saved_log_id: LogId,
    pub last_service_log_id: u64,
    /// Set while a log entry is being propagated or a resync applied.
    pub in_replication: bool,
}

impl NodeState {
    pub fn new(window: (Duration, Duration)) -> Self {
        Self {
            raft_role: RaftRole::Follower,
            leader: None,
            score: 0,
            score_count: 0,
            election_deadline: Instant::now() + jitter(window),
            epoch: 0,
            last_log_id: LogId::ZERO,
            log_count: 0,
            last_saved_log_id: LogId::ZERO,
            last_service_log_id: 0,
            in_replication: false,
        }
    }

    pub fn set_role(&mut self, role: RaftRole) {
        if self.raft_role != role {
            tracing::info!("Role changed from {} to {}", self.raft_role, role);
            self.raft_role = role;
            self.epoch += 1;
        }
    }

    pub fn set_leader(&mut self, leader: Option<NodeInfo>) {
        let old = self.leader.as_ref().map(|l| l.id.as_str());
        let new = leader.as_ref().map(|l| l.id.as_str());
        if old != new {
            match (&self.leader, &leader) {
                (Some(old), Some(new)) => {
                    tracing::info!("Leader changed from {} to {}", old.label(), new.label())
                }
                (None, Some(new)) => tracing::info!("Set leader: {}", new.label()),
                (Some(old), None) => tracing::info!("Lost leader {}", old.label()),
                (None, None) => {}
            }
        }
        self.leader = leader;
    }

    /// Becomes a follower of `leader`. Returns true if the leader changed.
    pub fn adopt_leader(&mut self, leader: NodeInfo, window: (Duration, Duration)) -> bool {
        let changed = self.leader.as_ref().map(|l| l.id != leader.id).unwrap_or(true);
        self.set_role(RaftRole::Follower);
        self.set_leader(Some(leader));
        self.reset_deadline(window);
        changed
    }

    pub fn reset_deadline(&mut self, window: (Duration, Duration)) {
        self.election_deadline = Instant::now() + jitter(window);
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.election_deadline
    }

    pub fn reset_score(&mut self) {
        self.score = 0;
        self.score_count = 0;
    }

    pub fn is_leader(&self) -> bool {
        self.raft_role == RaftRole::Leader
    }

    pub fn leader_id(&self) -> Option<String> {
        self.leader.as_ref().map(|l| l.id.clone())
    }
}

fn jitter((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
