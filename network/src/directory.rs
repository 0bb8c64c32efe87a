use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{LogId, NodeInfo, NodeStatus};

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Known peers, keyed by node id. Static peers that have never answered are
/// held under their `ip:port` until their first greeting.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<String, NodeInfo>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a peer as given, without touching its status.
    pub async fn upsert(&self, info: NodeInfo) {
        let mut peers = self.peers.write().await;
        peers.insert(info.id.clone(), info);
    }

    /// Records fresh contact with a peer: stores the info as alive, and drops
    /// the address placeholder it may have been known under.
    pub async fn touch(&self, mut info: NodeInfo) {
        info.status = NodeStatus::Alive;
        info.last_active_time = now_millis();

        let mut peers = self.peers.write().await;
        let key = info.address_key();
        if key != info.id {
            peers.remove(&key);
        }
        peers.insert(info.id.clone(), info);
    }

    pub async fn get(&self, id: &str) -> Option<NodeInfo> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> Option<NodeInfo> {
        self.peers.write().await.remove(id)
    }

    /// Removes every peer whose raft `ip:port` matches `addr`.
    pub async fn remove_by_address(&self, addr: &str) -> Vec<NodeInfo> {
        let mut peers = self.peers.write().await;
        let ids: Vec<String> = peers
            .values()
            .filter(|p| p.address_key() == addr || p.id == addr)
            .map(|p| p.id.clone())
            .collect();
        ids.iter().filter_map(|id| peers.remove(id)).collect()
    }

    pub async fn all(&self) -> Vec<NodeInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn alive(&self) -> Vec<NodeInfo> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_alive())
            .cloned()
            .collect()
    }

    pub async fn alive_count(&self) -> usize {
        self.peers.read().await.values().filter(|p| p.is_alive()).count()
    }

    /// Returns false if the peer is unknown.
    pub async fn set_status(&self, id: &str, status: NodeStatus) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(id) {
            Some(peer) => {
                if status == NodeStatus::Alive || peer.last_active_time == 0 {
                    peer.last_active_time = now_millis();
                }
                peer.status = status;
                true
            }
            None => false,
        }
    }

    /// Forgets peers that have been dead for longer than `older_than_ms`.
    pub async fn evict_dead(&self, older_than_ms: i64) -> Vec<String> {
        let cutoff = now_millis() - older_than_ms;
        let mut peers = self.peers.write().await;
        let expired: Vec<String> = peers
            .values()
            .filter(|p| !p.is_alive() && p.last_active_time < cutoff)
            .map(|p| p.id.clone())
            .collect();
        for id in &expired {
            peers.remove(id);
        }
        expired
    }

    pub async fn snapshot(&self) -> HashMap<String, NodeInfo> {
        self.peers.read().await.clone()
    }

    /// Adds peers we do not know yet, leaving existing entries alone.
    /// `skip` is the local node id.
    pub async fn merge_missing(&self, incoming: Vec<NodeInfo>, skip: &str) -> usize {
        let mut peers = self.peers.write().await;
        let mut added = 0;
        for info in incoming {
            if info.id == skip || peers.contains_key(&info.id) {
                continue;
            }
            if peers.contains_key(&info.address_key()) {
                continue;
            }
            peers.insert(info.id.clone(), info);
            added += 1;
        }
        added
    }

    /// Smallest log position any live peer has acknowledged.
    pub async fn min_alive_log_id(&self) -> Option<LogId> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_alive())
            .map(|p| p.last_log_id)
            .min()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}
