use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// The replicated key-value table.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn set_many(&self, items: HashMap<String, String>) {
        let mut data = self.data.write().await;
        data.extend(items);
    }

    /// Removes the given keys, returning how many were present.
    pub async fn remove_many(&self, keys: &[String]) -> usize {
        let mut data = self.data.write().await;
        keys.iter().filter(|k| data.remove(k.as_str()).is_some()).count()
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.data.read().await.clone()
    }

    /// Swaps in a whole new table, as done by a full resync or a restore.
    pub async fn replace(&self, table: HashMap<String, String>) {
        *self.data.write().await = table;
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}
