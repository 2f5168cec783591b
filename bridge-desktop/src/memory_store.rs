//! In-memory key-value store

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    storage::{BatchOperation, KeyValueStore, WriteBatch},
};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// `BTreeMap`-backed [`KeyValueStore`] for tests and ephemeral sessions.
///
/// A batch is applied while holding the map lock, so readers never observe a
/// partially applied batch.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn iterate_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.entries.lock().await.is_empty())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for op in batch.into_operations() {
            match op {
                BatchOperation::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
