//! Public types for the sync engine coordinator.

use crate::conflict::ConflictRecord;
use crate::entity::Entity;
use crate::error::SyncError;
use crate::queue::DrainReport;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No connectivity; writes queue up locally
    Offline,
    /// Online and replaying the queue
    Draining,
    /// Online with nothing being replayed
    Idle,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "Offline"),
            Self::Draining => write!(f, "Draining"),
            Self::Idle => write!(f, "Idle"),
        }
    }
}

/// Connectivity as reported by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    #[must_use]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl From<bool> for ConnectivityState {
    fn from(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

/// Notifications for the UI layer and other collaborators.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Local state of an entity changed (write, delete, confirmation, resolution, refresh)
    EntityUpdated(Entity),
    SyncStarted,
    SyncCompleted(DrainReport),
    ConflictDetected(ConflictRecord),
    ConflictResolved(ConflictRecord),
    /// A queued mutation was rejected by the remote and dropped
    ItemRejected {
        entity_id: String,
        status: u16,
        message: String,
    },
    ConnectivityChanged(ConnectivityState),
}

impl SyncEvent {
    /// Short label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EntityUpdated(_) => "entity_updated",
            Self::SyncStarted => "sync_started",
            Self::SyncCompleted(_) => "sync_completed",
            Self::ConflictDetected(_) => "conflict_detected",
            Self::ConflictResolved(_) => "conflict_resolved",
            Self::ItemRejected { .. } => "item_rejected",
            Self::ConnectivityChanged(_) => "connectivity_changed",
        }
    }

    /// The [`SyncError::RemoteRejected`] carried by an `ItemRejected` event.
    pub fn rejection(&self) -> Option<SyncError> {
        match self {
            Self::ItemRejected { entity_id, status, message } => Some(SyncError::RemoteRejected {
                key: entity_id.clone(),
                status: *status,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}
