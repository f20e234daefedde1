use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{Precondition, RemoteApi, RemoteError};
use crate::entity::Snapshot;

/// In-process remote with the same versioning contract as the HTTP API.
///
/// Every accepted write bumps the resource version by one. Deleted resources
/// stay behind as tombstones so later conflicts can report the version the
/// delete happened at. Connectivity, latency and per-id rejections can be
/// switched at runtime, which makes it the reference double for tests and
/// demos.
pub struct InMemoryRemote {
    resources: Mutex<HashMap<String, Snapshot>>,
    rejections: Mutex<HashMap<String, (u16, String)>>,
    latency: Mutex<Option<Duration>>,
    online: AtomicBool,
    fetch_calls: AtomicU64,
    put_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            rejections: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
            online: AtomicBool::new(true),
            fetch_calls: AtomicU64::new(0),
            put_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Answer writes to `id` with a non-conflict error.
    pub fn reject(&self, id: &str, status: u16, message: &str) {
        self.rejections.lock().insert(id.to_string(), (status, message.to_string()));
    }

    pub fn clear_rejection(&self, id: &str) {
        self.rejections.lock().remove(id);
    }

    /// Write directly on the server side (as another client would), bumping the version.
    pub fn seed(&self, id: &str, payload: Value) -> Snapshot {
        let mut resources = self.resources.lock();
        let version = resources.get(id).map_or(0, |s| s.version) + 1;
        let snapshot = Snapshot::new(payload, version);
        resources.insert(id.to_string(), snapshot.clone());
        snapshot
    }

    /// Overwrite server-side state verbatim.
    pub fn set_snapshot(&self, id: &str, snapshot: Snapshot) {
        self.resources.lock().insert(id.to_string(), snapshot);
    }

    /// Server-side state, tombstones included.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<Snapshot> {
        self.resources.lock().get(id).cloned()
    }

    #[must_use]
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_online() {
            return Err(RemoteError::Unavailable("remote offline".to_string()));
        }
        Ok(())
    }

    fn rejection(&self, id: &str) -> Result<(), RemoteError> {
        match self.rejections.lock().get(id) {
            Some((status, message)) => Err(RemoteError::Rejected {
                status: *status,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn fetch(&self, id: &str) -> Result<Option<Snapshot>, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.enter().await?;

        Ok(self.resources.lock().get(id).filter(|s| !s.deleted).cloned())
    }

    async fn put(&self, id: &str, payload: &Value, precondition: Precondition) -> Result<Snapshot, RemoteError> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        self.enter().await?;
        self.rejection(id)?;

        let mut resources = self.resources.lock();
        let current = resources.get(id).cloned();
        let current_version = current.as_ref().map_or(0, |s| s.version);

        if let Precondition::IfVersion(expected) = precondition {
            if expected != current_version {
                let snapshot = current.unwrap_or_else(|| Snapshot::tombstone(0));
                debug!(id, expected, actual = snapshot.version, "Rejecting stale write");
                return Err(RemoteError::Conflict(snapshot));
            }
        }

        let snapshot = Snapshot::new(payload.clone(), current_version + 1);
        resources.insert(id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete(&self, id: &str, precondition: Precondition) -> Result<Snapshot, RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.enter().await?;
        self.rejection(id)?;

        let mut resources = self.resources.lock();
        let current = match resources.get(id) {
            Some(snapshot) if !snapshot.deleted => snapshot.clone(),
            _ => return Err(RemoteError::NotFound),
        };

        if let Precondition::IfVersion(expected) = precondition {
            if expected != current.version {
                return Err(RemoteError::Conflict(current));
            }
        }

        let tombstone = Snapshot::tombstone(current.version + 1);
        resources.insert(id.to_string(), tombstone.clone());
        Ok(tombstone)
    }
}
