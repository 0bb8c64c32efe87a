use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;

use network::{LogEntry, LogId};

/// In-memory journal of replicated mutations. The newest entry sits at the
/// front; replay walks from the back.
#[derive(Debug, Clone, Default)]
pub struct ReplicationLog {
    entries: Arc<RwLock<VecDeque<LogEntry>>>,
}

impl ReplicationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an entry with the same id is already present.
    pub async fn push(&self, entry: LogEntry) -> bool {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return false;
        }
        entries.push_front(entry);
        true
    }

    pub async fn newest_id(&self) -> LogId {
        self.entries
            .read()
            .await
            .front()
            .map(|e| e.id)
            .unwrap_or(LogId::ZERO)
    }

    /// Entries newer than `after`, oldest first. `None` means `after` is not
    /// in the log, so the gap cannot be covered from here. `LogId::ZERO`
    /// matches the start of the log.
    pub async fn entries_after(&self, after: LogId) -> Option<Vec<LogEntry>> {
        let entries = self.entries.read().await;
        if after.is_zero() {
            return Some(entries.iter().rev().cloned().collect());
        }

        let position = entries.iter().position(|e| e.id == after)?;
        Some(entries.iter().take(position).rev().cloned().collect())
    }

    /// Drops every entry at or below `upto`, provided `upto` itself is in the
    /// log. Returns how many entries were removed.
    pub async fn trim_through(&self, upto: LogId) -> usize {
        let mut entries = self.entries.write().await;
        if !entries.iter().any(|e| e.id == upto) {
            return 0;
        }
        let before = entries.len();
        entries.retain(|e| e.id > upto);
        before - entries.len()
    }

    /// Newest first.
    pub async fn all(&self) -> Vec<LogEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn restore(&self, entries: Vec<LogEntry>) {
        *self.entries.write().await = entries.into_iter().collect();
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
