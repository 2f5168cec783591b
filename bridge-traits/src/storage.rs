//! Ordered Key-Value Storage Abstraction
//!
//! The sync core persists its index into an ordered key-value store and relies
//! on exactly one guarantee: a committed [`WriteBatch`] is applied atomically.
//! Everything else (caching, compaction, file layout) is up to the host.

use async_trait::async_trait;

use crate::error::Result;

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl BatchOperation {
    /// Key touched by this operation
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Ordered list of puts and deletes committed as one unit.
///
/// Later operations on the same key win, matching the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    operations: Vec<BatchOperation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a put of `value` under `key`
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.operations.push(BatchOperation::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queue a deletion of `key`
    pub fn delete(&mut self, key: impl Into<String>) {
        self.operations
            .push(BatchOperation::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<BatchOperation> {
        self.operations
    }
}

/// Ordered key-value store trait
///
/// Implementations:
/// - **Desktop**: SQLite table (`bridge-desktop::SqliteKeyValueStore`)
/// - **Tests**: in-memory `BTreeMap` (`bridge-desktop::MemoryKeyValueStore`)
///
/// Iteration returns entries sorted by key.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::{KeyValueStore, WriteBatch};
///
/// async fn save(store: &dyn KeyValueStore) -> Result<()> {
///     let mut batch = WriteBatch::new();
///     batch.put("tracker:1", b"{...}".to_vec());
///     batch.delete("tracker:2");
///     store.write(batch).await
/// }
/// ```
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a single value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a single value outside of any batch
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a single key
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    async fn iterate_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Every entry in key order
    async fn iterate(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.iterate_prefix("").await
    }

    /// Whether the store holds no entries at all
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.iterate().await?.is_empty())
    }

    /// Commit a batch atomically
    async fn write(&self, batch: WriteBatch) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch_keeps_order() {
        let mut batch = WriteBatch::new();
        batch.put("a", b"1".to_vec());
        batch.delete("b");
        batch.put("a", b"2".to_vec());

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.operations()[1].key(), "b");
        assert_eq!(
            batch.operations()[2],
            BatchOperation::Put {
                key: "a".to_string(),
                value: b"2".to_vec()
            }
        );
    }

    #[test]
    fn test_empty_batch() {
        let batch = WriteBatch::default();
        assert!(batch.is_empty());
        assert!(batch.into_operations().is_empty());
    }
}
