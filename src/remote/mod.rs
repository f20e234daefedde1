//! Remote API boundary.
//!
//! The engine consumes a resource API shaped like
//! `GET/PUT/DELETE /resource/{id}` returning `{payload, version, updatedAt}`.
//! A conditional write against a stale version answers with a conflict that
//! carries the current remote snapshot, so conflicts are detected without a
//! second round trip. Transport is up to the implementor.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::entity::Snapshot;

/// Version check applied by the remote to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Apply only if the remote is still at this version (0 = must not exist)
    IfVersion(u64),
    /// Apply regardless of the remote version
    Force,
}

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unavailable(String),

    #[error("remote request timed out")]
    Timeout,

    #[error("version conflict: remote is at version {}", .0.version)]
    Conflict(Snapshot),

    #[error("resource not found")]
    NotFound,

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    /// Worth retrying later (network trouble), as opposed to a definitive answer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }

    /// Equivalent HTTP status, where one applies.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Conflict(_) => Some(409),
            Self::NotFound => Some(404),
            Self::Rejected { status, .. } => Some(*status),
            Self::Timeout => Some(408),
            Self::Unavailable(_) => None,
        }
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Current remote state; `None` if the resource does not exist.
    async fn fetch(&self, id: &str) -> Result<Option<Snapshot>, RemoteError>;

    /// Create or replace; returns the new remote snapshot.
    async fn put(&self, id: &str, payload: &Value, precondition: Precondition) -> Result<Snapshot, RemoteError>;

    /// Delete; returns the resulting tombstone.
    async fn delete(&self, id: &str, precondition: Precondition) -> Result<Snapshot, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Unavailable("offline".into()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(!RemoteError::NotFound.is_transient());
        assert!(!RemoteError::Conflict(Snapshot::new(json!(1), 2)).is_transient());
        assert!(!RemoteError::Rejected { status: 422, message: "bad".into() }.is_transient());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RemoteError::Conflict(Snapshot::new(json!(1), 2)).status(), Some(409));
        assert_eq!(RemoteError::NotFound.status(), Some(404));
        assert_eq!(RemoteError::Rejected { status: 500, message: "boom".into() }.status(), Some(500));
        assert_eq!(RemoteError::Unavailable("x".into()).status(), None);
    }

    #[test]
    fn test_conflict_display_names_version() {
        let err = RemoteError::Conflict(Snapshot::new(json!("server"), 9));
        assert_eq!(err.to_string(), "version conflict: remote is at version 9");
    }
}
