use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{key}': {detail}")]
    Corruption {
        key: String,
        detail: String,
    },
}

/// One staged mutation inside an atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Durable key-value substrate under the engine.
///
/// Implementations must survive process restarts and must apply a batch
/// passed to [`apply`](DurableStore::apply) all-or-nothing. Per-key
/// serialization of read-modify-write sequences is layered on top by
/// [`LocalStore`](super::local::LocalStore).
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Commit a batch atomically.
    async fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StorageError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.apply(vec![WriteOp::Put { key: key.to_string(), value }]).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.apply(vec![WriteOp::Delete { key: key.to_string() }]).await
    }
}
