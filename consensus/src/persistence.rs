use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::interval;

use network::{LogEntry, LogId, NodeInfo, NodeStatus, Service};

use crate::raft::RaftNode;
use crate::Result;

/// Everything a node needs to come back after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_log_id: LogId,
    pub log_count: u64,
    /// Newest first, as held in memory.
    pub log: Vec<LogEntry>,
    pub last_service_log_id: u64,
    pub services: HashMap<String, Service>,
    pub peers: HashMap<String, NodeInfo>,
    pub kv: HashMap<String, String>,
}

impl RaftNode {
    pub(crate) async fn capture(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            last_log_id: state.last_log_id,
            log_count: state.log_count,
            log: self.log.all().await,
            last_service_log_id: state.last_service_log_id,
            services: self.services.all().await,
            peers: self.network.peers().snapshot().await,
            kv: self.kv.snapshot().await,
        }
    }

    pub async fn save(&self) -> Result<()> {
        let snapshot = self.capture().await;
        let bytes = self.snapshots.save(&snapshot).await?;
        self.state.write().await.last_saved_log_id = snapshot.last_log_id;
        tracing::trace!("Saved snapshot at log id {} ({} bytes)", snapshot.last_log_id, bytes);
        Ok(())
    }

    /// Loads the snapshot file if there is one. Locally configured peers and
    /// services win over restored ones with the same key.
    pub async fn restore(&self) -> Result<bool> {
        let Some(snapshot) = self.snapshots.load::<Snapshot>().await? else {
            return Ok(false);
        };

        let mut state = self.state.write().await;
        state.last_log_id = state.last_log_id.max(snapshot.last_log_id);
        state.log_count = state.log_count.max(snapshot.log_count);
        state.last_service_log_id = state.last_service_log_id.max(snapshot.last_service_log_id);
        state.last_saved_log_id = state.last_log_id;

        self.kv.replace(snapshot.kv).await;
        self.log.restore(snapshot.log).await;
        self.services.merge_missing(snapshot.services).await;

        let peers: Vec<NodeInfo> = snapshot
            .peers
            .into_values()
            .map(|mut peer| {
                peer.status = NodeStatus::Dead;
                peer
            })
            .collect();
        let restored_peers = self.network.peers().merge_missing(peers, &self.identity.id).await;

        tracing::info!(
            "Restored snapshot from {:?}: log id {}, {} entries, {} peers",
            self.snapshots.path(),
            state.last_log_id,
            state.log_count,
            restored_peers
        );
        Ok(true)
    }

    /// Saves on every tick, and right away whenever the log watermark moved
    /// past what was last written.
    pub(crate) async fn autosave_loop(&self) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.config.autosave_interval_ms));

        loop {
            let forced = tokio::select! {
                _ = ticker.tick() => true,
                _ = self.save_signal.notified() => false,
            };
            if !self.is_running() {
                return Ok(());
            }

            if !forced {
                let state = self.state.read().await;
                if state.last_log_id == state.last_saved_log_id {
                    continue;
                }
            }

            if let Err(e) = self.save().await {
                tracing::warn!("Failed to save snapshot to {:?}: {}", self.snapshots.path(), e);
            }
        }
    }
}
