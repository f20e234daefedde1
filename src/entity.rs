//! Entity data structures.
//!
//! An [`Entity`] is the unit of application data the engine caches, mutates
//! optimistically and reconciles with the remote. A [`Snapshot`] is the
//! version-stamped view of an entity on one side of the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Sync status of a locally held entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// Local version equals the last confirmed remote version
    Synced,
    /// A local mutation is waiting in the queue
    Pending,
    /// A conflict is parked awaiting a manual choice
    Conflicted,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => write!(f, "synced"),
            Self::Pending => write!(f, "pending"),
            Self::Conflicted => write!(f, "conflicted"),
        }
    }
}

/// Version-stamped state of an entity as seen by one party.
///
/// Remote responses (`GET/PUT/DELETE /resource/{id}`) are decoded into this
/// shape. A deleted resource is represented with `deleted = true` so that a
/// conflict against a remote delete still carries the version it happened at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub payload: Value,
    pub version: u64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Snapshot {
    pub fn new(payload: Value, version: u64) -> Self {
        Self {
            payload,
            version,
            updated_at: now_millis(),
            deleted: false,
        }
    }

    /// A tombstone at the given version.
    pub fn tombstone(version: u64) -> Self {
        Self {
            payload: Value::Null,
            version,
            updated_at: now_millis(),
            deleted: true,
        }
    }
}

/// A user-level record held in the durable store.
///
/// # Example
///
/// ```
/// use offline_sync::{Entity, SyncState};
/// use serde_json::json;
///
/// let entity = Entity::new_local("note.1", json!({"title": "draft"}), None);
/// assert_eq!(entity.version, 1);
/// assert_eq!(entity.remote_version, 0);
/// assert_eq!(entity.sync_state, SyncState::Pending);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable id, caller-assigned
    pub id: String,
    /// Opaque application data
    pub payload: Value,
    /// Version this state has (or will have once the pending mutation is confirmed)
    pub version: u64,
    /// Last version confirmed by the remote (0 = never synced)
    pub remote_version: u64,
    /// Local write counter, strictly increasing
    pub revision: u64,
    /// Last update timestamp (epoch millis)
    pub updated_at: i64,
    pub sync_state: SyncState,
    /// Tombstone for a pending local delete
    #[serde(default)]
    pub deleted: bool,
    /// Routing / policy class (e.g. "notes", "avatars")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<String>,
}

impl Entity {
    /// Create an entity from a first local write.
    pub fn new_local(id: impl Into<String>, payload: Value, resource_class: Option<String>) -> Self {
        Self {
            id: id.into(),
            payload,
            version: 1,
            remote_version: 0,
            revision: 1,
            updated_at: now_millis(),
            sync_state: SyncState::Pending,
            deleted: false,
            resource_class,
        }
    }

    /// Create a synced entity from a remote snapshot.
    pub fn from_remote(id: impl Into<String>, snapshot: &Snapshot, resource_class: Option<String>) -> Self {
        Self {
            id: id.into(),
            payload: snapshot.payload.clone(),
            version: snapshot.version,
            remote_version: snapshot.version,
            revision: 1,
            updated_at: snapshot.updated_at,
            sync_state: SyncState::Synced,
            deleted: snapshot.deleted,
            resource_class,
        }
    }

    /// Apply an optimistic local upsert.
    #[must_use]
    pub fn with_local_write(mut self, payload: Value) -> Self {
        self.payload = payload;
        self.deleted = false;
        self.mark_local_change();
        self
    }

    /// Apply an optimistic local delete (tombstone).
    #[must_use]
    pub fn with_local_delete(mut self) -> Self {
        self.payload = Value::Null;
        self.deleted = true;
        self.mark_local_change();
        self
    }

    fn mark_local_change(&mut self) {
        self.version = self.remote_version + 1;
        self.revision += 1;
        self.updated_at = now_millis().max(self.updated_at);
        self.sync_state = SyncState::Pending;
    }

    /// Adopt remote state, keeping the revision counter moving forward.
    #[must_use]
    pub fn with_remote_state(mut self, snapshot: &Snapshot) -> Self {
        self.payload = snapshot.payload.clone();
        self.version = snapshot.version;
        self.remote_version = snapshot.version;
        self.revision += 1;
        self.updated_at = snapshot.updated_at;
        self.deleted = snapshot.deleted;
        self.sync_state = SyncState::Synced;
        self
    }

    /// Mark the current local state as confirmed at `remote_version`.
    #[must_use]
    pub fn confirmed_at(mut self, remote_version: u64) -> Self {
        self.version = remote_version;
        self.remote_version = remote_version;
        self.sync_state = SyncState::Synced;
        self
    }

    /// Record a newer remote version under a still-pending local change.
    #[must_use]
    pub fn rebased_onto(mut self, remote_version: u64) -> Self {
        self.remote_version = remote_version;
        self.version = remote_version + 1;
        self
    }

    /// The local side of this entity as a snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            payload: self.payload.clone(),
            version: self.version,
            updated_at: self.updated_at,
            deleted: self.deleted,
        }
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }

    /// Whether reads should see this entity.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_local_entity() {
        let entity = Entity::new_local("e-1", json!({"k": "v"}), Some("notes".into()));

        assert_eq!(entity.id, "e-1");
        assert_eq!(entity.version, 1);
        assert_eq!(entity.remote_version, 0);
        assert_eq!(entity.revision, 1);
        assert!(entity.updated_at > 0);
        assert_eq!(entity.sync_state, SyncState::Pending);
        assert!(entity.is_visible());
        assert_eq!(entity.resource_class.as_deref(), Some("notes"));
    }

    #[test]
    fn test_from_remote_is_synced() {
        let snapshot = Snapshot::new(json!("server"), 7);
        let entity = Entity::from_remote("e-1", &snapshot, None);

        assert!(entity.is_synced());
        assert_eq!(entity.version, 7);
        assert_eq!(entity.remote_version, 7);
        assert_eq!(entity.payload, json!("server"));
    }

    #[test]
    fn test_local_write_targets_next_remote_version() {
        let entity = Entity::from_remote("e-1", &Snapshot::new(json!("a"), 1), None);

        let once = entity.with_local_write(json!("b"));
        assert_eq!(once.version, 2);
        assert_eq!(once.revision, 2);
        assert_eq!(once.sync_state, SyncState::Pending);

        // Repeated offline writes share the target version but not the revision
        let twice = once.with_local_write(json!("c"));
        assert_eq!(twice.version, 2);
        assert_eq!(twice.revision, 3);
        assert_eq!(twice.payload, json!("c"));
    }

    #[test]
    fn test_local_delete_is_tombstone() {
        let entity = Entity::from_remote("e-1", &Snapshot::new(json!("a"), 3), None)
            .with_local_delete();

        assert!(entity.deleted);
        assert!(!entity.is_visible());
        assert_eq!(entity.payload, Value::Null);
        assert_eq!(entity.version, 4);
        assert_eq!(entity.sync_state, SyncState::Pending);
    }

    #[test]
    fn test_with_remote_state_keeps_revision_moving() {
        let entity = Entity::new_local("e-1", json!("local"), None)
            .with_remote_state(&Snapshot::new(json!("remote"), 5));

        assert_eq!(entity.revision, 2);
        assert_eq!(entity.version, 5);
        assert!(entity.is_synced());
        assert_eq!(entity.payload, json!("remote"));
    }

    #[test]
    fn test_confirmed_and_rebased() {
        let pending = Entity::new_local("e-1", json!(1), None);

        let confirmed = pending.clone().confirmed_at(1);
        assert!(confirmed.is_synced());
        assert_eq!(confirmed.version, confirmed.remote_version);

        let rebased = pending.rebased_onto(4);
        assert_eq!(rebased.remote_version, 4);
        assert_eq!(rebased.version, 5);
        assert_eq!(rebased.sync_state, SyncState::Pending);
    }

    #[test]
    fn test_serde_shape() {
        let entity = Entity::new_local("e-1", json!({"a": 1}), None);
        let value = serde_json::to_value(&entity).unwrap();

        assert_eq!(value["sync_state"], "pending");
        assert!(value.get("resource_class").is_none());

        let back: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn test_sync_state_display() {
        assert_eq!(SyncState::Synced.to_string(), "synced");
        assert_eq!(SyncState::Pending.to_string(), "pending");
        assert_eq!(SyncState::Conflicted.to_string(), "conflicted");
    }
}
