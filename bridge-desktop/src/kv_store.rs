//! Ordered key-value store on SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{BatchOperation, KeyValueStore, WriteBatch},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row,
};
use std::path::Path;
use tracing::{debug, error};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY NOT NULL,
        value BLOB NOT NULL
    )
"#;

const UPSERT: &str = r#"
    INSERT INTO kv (key, value) VALUES (?, ?)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#;

/// SQLite-backed [`KeyValueStore`]
///
/// All rows live in one `kv` table keyed by TEXT, so `ORDER BY key` gives the
/// byte-wise key order the metadata index expects. A [`WriteBatch`] is
/// committed inside a single SQL transaction.
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

fn db_error(context: &str, err: sqlx::Error) -> BridgeError {
    BridgeError::DatabaseError(format!("{}: {}", context, err))
}

impl SqliteKeyValueStore {
    /// Open (or create) the store at `db_path`
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(BridgeError::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| db_error("Failed to open key-value store", e))?;

        let store = Self { pool };
        store.create_schema().await?;
        debug!(path = ?db_path, "Opened key-value store");
        Ok(store)
    }

    /// Private in-memory database, used by tests
    ///
    /// Every pooled connection to `sqlite::memory:` gets its own database, so
    /// the pool is pinned to one connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("Failed to open in-memory store", e))?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to create kv table", e))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to read key", e))?;

        row.map(|row| row.try_get::<Vec<u8>, _>(0))
            .transpose()
            .map_err(|e| db_error("Failed to decode value", e))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(UPSERT)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to write key", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to delete key", e))?;
        Ok(())
    }

    async fn iterate_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM kv WHERE substr(key, 1, ?) = ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to iterate keys", e))?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get(0)?;
                let value: Vec<u8> = row.try_get(1)?;
                Ok((key, value))
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| db_error("Failed to decode row", e))
    }

    async fn is_empty(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM kv LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to probe store", e))?;
        Ok(row.is_none())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let size = batch.len();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin batch", e))?;

        for op in batch.into_operations() {
            let result = match &op {
                BatchOperation::Put { key, value } => {
                    sqlx::query(UPSERT)
                        .bind(key.as_str())
                        .bind(value.as_slice())
                        .execute(&mut *tx)
                        .await
                }
                BatchOperation::Delete { key } => {
                    sqlx::query("DELETE FROM kv WHERE key = ?")
                        .bind(key.as_str())
                        .execute(&mut *tx)
                        .await
                }
            };

            if let Err(e) = result {
                error!(key = op.key(), error = %e, "Batch operation failed, rolling back");
                tx.rollback()
                    .await
                    .map_err(|e| db_error("Failed to roll back batch", e))?;
                return Err(db_error("Failed to apply batch", e));
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit batch", e))?;

        debug!(operations = size, "Committed write batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();
        assert!(store.is_empty().await.unwrap());

        store.put("tracker:1", b"one").await.unwrap();
        assert_eq!(store.get("tracker:1").await.unwrap(), Some(b"one".to_vec()));

        store.put("tracker:1", b"uno").await.unwrap();
        assert_eq!(store.get("tracker:1").await.unwrap(), Some(b"uno".to_vec()));

        store.delete("tracker:1").await.unwrap();
        assert_eq!(store.get("tracker:1").await.unwrap(), None);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_iterate_prefix_is_ordered() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();
        store.put("tracker:2", b"b").await.unwrap();
        store.put("file:x", b"x").await.unwrap();
        store.put("tracker:10", b"c").await.unwrap();
        store.put("tracker:1", b"a").await.unwrap();

        let keys: Vec<String> = store
            .iterate_prefix("tracker:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["tracker:1", "tracker:10", "tracker:2"]);

        assert_eq!(store.iterate().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_write_batch_applies_in_order() {
        let store = SqliteKeyValueStore::in_memory().await.unwrap();
        store.put("stale", b"old").await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put("service", b"meta".to_vec());
        batch.delete("stale");
        batch.put("tracker:1", b"first".to_vec());
        batch.put("tracker:1", b"second".to_vec());
        store.write(batch).await.unwrap();

        assert_eq!(store.get("stale").await.unwrap(), None);
        assert_eq!(store.get("service").await.unwrap(), Some(b"meta".to_vec()));
        assert_eq!(
            store.get("tracker:1").await.unwrap(),
            Some(b"second".to_vec())
        );
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.db");

        {
            let store = SqliteKeyValueStore::open(&path).await.unwrap();
            let mut batch = WriteBatch::new();
            batch.put("version", b"1".to_vec());
            store.write(batch).await.unwrap();
        }

        let store = SqliteKeyValueStore::open(&path).await.unwrap();
        assert_eq!(store.get("version").await.unwrap(), Some(b"1".to_vec()));
    }
}
