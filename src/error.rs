//! Error types for the sync engine.

use thiserror::Error;

use crate::storage::traits::StorageError;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a [`SyncError`], stable for callers to match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No data from cache or network
    Unavailable,
    /// Key absent (cache-only, or remote says it does not exist)
    NotFound,
    /// A manual conflict is still pending
    ConflictUnresolved,
    /// Durable queue failed its integrity check on load
    QueueCorrupt,
    /// Non-conflict rejection from the remote
    RemoteRejected,
    /// Durable store failure
    Storage,
    /// Invalid configuration or engine wiring
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::NotFound => "not_found",
            Self::ConflictUnresolved => "conflict_unresolved",
            Self::QueueCorrupt => "queue_corrupt",
            Self::RemoteRejected => "remote_rejected",
            Self::Storage => "storage",
            Self::Config => "config",
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no data available for '{key}': {reason}")]
    Unavailable { key: String, reason: String },

    #[error("'{key}' not found")]
    NotFound { key: String },

    #[error("conflict on '{key}' is awaiting manual resolution")]
    ConflictUnresolved { key: String },

    #[error("sync queue failed integrity check: {0}")]
    QueueCorrupt(String),

    #[error("remote rejected '{key}' ({status}): {message}")]
    RemoteRejected { key: String, status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ConflictUnresolved { .. } => ErrorKind::ConflictUnresolved,
            Self::QueueCorrupt(_) => ErrorKind::QueueCorrupt,
            Self::RemoteRejected { .. } => ErrorKind::RemoteRejected,
            Self::Storage(_) | Self::Serialization(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub(crate) fn unavailable(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable { key: key.into(), reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SyncError::not_found("a").kind(), ErrorKind::NotFound);
        assert_eq!(SyncError::unavailable("a", "offline").kind(), ErrorKind::Unavailable);
        assert_eq!(SyncError::QueueCorrupt("bad".into()).kind(), ErrorKind::QueueCorrupt);
        assert_eq!(
            SyncError::Storage(StorageError::Backend("disk".into())).kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn test_display() {
        let err = SyncError::RemoteRejected { key: "n.1".into(), status: 422, message: "invalid".into() };
        assert_eq!(err.to_string(), "remote rejected 'n.1' (422): invalid");

        let err = SyncError::unavailable("n.1", "remote request timed out");
        assert!(err.to_string().contains("timed out"));
    }
}
