// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite backend for the durable store.
//!
//! A single key/value table holds entities, queue records and conflict
//! records side by side so that one SQLite transaction can commit an entity
//! write together with its queue entry:
//!
//! ```sql
//! CREATE TABLE kv (
//!   key   TEXT PRIMARY KEY,
//!   value BLOB NOT NULL
//! )
//! ```
//!
//! The database runs in WAL journal mode with `synchronous = NORMAL`, which
//! is crash-safe and lets readers proceed during a commit.

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{DurableStore, StorageError, WriteOp};
use crate::resilience::retry::{retry, RetryConfig};

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct SqliteStore {
    pool: SqlitePool,
    location: String,
}

impl SqliteStore {
    /// Open (or create) a store file, with startup-mode retry.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let location = path.as_ref().to_string_lossy().to_string();
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        Self::connect_with(options, 8, location).await
    }

    /// Private in-memory database (single connection, lost on drop).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(backend_err)?;
        Self::connect_with(options, 1, ":memory:".to_string()).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
        location: String,
    ) -> Result<Self, StorageError> {
        info!(location = %location, "Opening SQLite durable store");

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(backend_err)
            }
        })
        .await?;

        let store = Self { pool, location };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    /// Where this store lives (path or `:memory:`).
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>("value").map_err(backend_err)?)),
            None => Ok(None),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let rows = sqlx::query("SELECT key, value FROM kv WHERE substr(key, 1, ?) = ? ORDER BY key")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(backend_err)?;
                let value: Vec<u8> = row.try_get("value").map_err(backend_err)?;
                Ok((key, value))
            })
            .collect()
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        let count = ops.len();

        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    sqlx::query(
                        "INSERT INTO kv (key, value) VALUES (?, ?) \
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend_err)?;
                }
                WriteOp::Delete { key } => {
                    sqlx::query("DELETE FROM kv WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(backend_err)?;
                }
            }
        }
        tx.commit().await.map_err(backend_err)?;

        debug!(ops = count, "SQLite batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(key: &str, value: &[u8]) -> WriteOp {
        WriteOp::Put { key: key.to_string(), value: value.to_vec() }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = SqliteStore::in_memory().await.unwrap();

        store.put("entity/a", b"alpha".to_vec()).await.unwrap();
        assert_eq!(store.get("entity/a").await.unwrap().as_deref(), Some(&b"alpha"[..]));

        store.put("entity/a", b"beta".to_vec()).await.unwrap();
        assert_eq!(store.get("entity/a").await.unwrap().as_deref(), Some(&b"beta"[..]));

        store.delete("entity/a").await.unwrap();
        assert!(store.get("entity/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_prefix_ordered() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .apply(vec![
                put("queue/00000000000000000010", b"b"),
                put("queue/00000000000000000002", b"a"),
                put("entity/q", b"x"),
            ])
            .await
            .unwrap();

        let scanned = store.scan("queue/").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, "queue/00000000000000000002");
        assert_eq!(scanned[1].1, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_apply_is_atomic_per_batch() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put("keep", b"1".to_vec()).await.unwrap();

        store
            .apply(vec![put("a", b"1"), put("b", b"2"), WriteOp::Delete { key: "keep".into() }])
            .await
            .unwrap();

        assert!(store.get("keep").await.unwrap().is_none());
        assert_eq!(store.scan("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offline.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.put("entity/persist", b"kept".to_vec()).await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.get("entity/persist").await.unwrap().as_deref(), Some(&b"kept"[..]));
        assert!(store.location().ends_with("offline.db"));
    }
}
