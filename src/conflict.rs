//! Conflict detection and resolution.
//!
//! A conflict exists when a queued mutation's base version no longer matches
//! the remote at replay time. [`ConflictResolver::resolve`] is a pure decision
//! over the two snapshots; the engine performs whatever I/O the outcome calls
//! for (write back, resubmit or park).
//!
//! ```text
//! Detected ──┬──► ServerWins ──┐
//!            ├──► ClientWins ──┤
//!            ├──► Merged ──────┼──► Resolved
//!            └──► AwaitingManual ──► {ServerWins, ClientWins, Merged}
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{now_millis, Snapshot};
use crate::queue::{Operation, QueueItem};

/// How to settle a version disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Remote state replaces the local mutation
    #[default]
    ServerWins,
    /// Local state is resubmitted without a version check
    ClientWins,
    /// Payloads are combined by the configured [`MergeStrategy`]
    Merge,
    /// Park the conflict until the caller chooses
    Manual,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerWins => "server-wins",
            Self::ClientWins => "client-wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pluggable payload merge.
///
/// Receives the local mutation and the current remote state and returns the
/// snapshot to submit. The returned `version` is the remote version the merge
/// is based on.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, local: &Snapshot, remote: &Snapshot) -> Snapshot;
}

/// Field-level merge: local object fields overlay the remote object.
///
/// Nested objects merge recursively. Anything that is not an object on both
/// sides is taken from the local payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl MergeStrategy for FieldMerge {
    fn merge(&self, local: &Snapshot, remote: &Snapshot) -> Snapshot {
        Snapshot {
            payload: merge_fields(&local.payload, &remote.payload),
            version: remote.version,
            updated_at: now_millis(),
            deleted: false,
        }
    }
}

/// Overlay `local` onto `remote`.
pub fn merge_fields(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(local), Value::Object(remote)) => {
            let mut merged: Map<String, Value> = remote.clone();
            for (key, local_value) in local {
                let value = match merged.get(key) {
                    Some(remote_value) => merge_fields(local_value, remote_value),
                    None => local_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (local, _) => local.clone(),
    }
}

/// Decision reached for one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// Adopt this remote snapshot and drop the local mutation
    ServerWins(Snapshot),
    /// Resubmit this local snapshot with an override
    ClientWins(Snapshot),
    /// Submit this merged snapshot conditionally on its `version`
    Merged(Snapshot),
    /// Keep the conflict until a [`ManualChoice`] arrives
    AwaitingManual,
}

impl ResolutionOutcome {
    pub fn resolution(&self) -> Resolution {
        match self {
            Self::ServerWins(_) => Resolution::ServerWins,
            Self::ClientWins(_) => Resolution::ClientWins,
            Self::Merged(_) => Resolution::Merged,
            Self::AwaitingManual => Resolution::Unresolved,
        }
    }

    pub fn state(&self) -> ConflictState {
        match self {
            Self::ServerWins(_) => ConflictState::ServerWins,
            Self::ClientWins(_) => ConflictState::ClientWins,
            Self::Merged(_) => ConflictState::Merged,
            Self::AwaitingManual => ConflictState::AwaitingManual,
        }
    }
}

/// Recorded resolution of a [`ConflictRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    Unresolved,
    ServerWins,
    ClientWins,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictState {
    Detected,
    ServerWins,
    ClientWins,
    Merged,
    AwaitingManual,
    Resolved,
}

impl ConflictState {
    pub fn can_transition_to(self, next: ConflictState) -> bool {
        use ConflictState::*;
        matches!(
            (self, next),
            (Detected, ServerWins | ClientWins | Merged | AwaitingManual)
                | (AwaitingManual, ServerWins | ClientWins | Merged)
                | (ServerWins | ClientWins | Merged, Resolved)
        )
    }
}

/// A detected conflict, persisted while it awaits a manual choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_id: String,
    pub local_snapshot: Snapshot,
    pub remote_snapshot: Snapshot,
    pub detected_at: i64,
    pub resolution: Resolution,
    pub state: ConflictState,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<String>,
}

impl ConflictRecord {
    pub fn new(item: &QueueItem, remote: Snapshot) -> Self {
        Self {
            entity_id: item.entity_id.clone(),
            local_snapshot: item.local_snapshot(),
            remote_snapshot: remote,
            detected_at: now_millis(),
            resolution: Resolution::Unresolved,
            state: ConflictState::Detected,
            operation: item.operation,
            resource_class: item.resource_class.clone(),
        }
    }

    /// Move to `next`, returning false (and staying put) if not allowed.
    pub fn transition(&mut self, next: ConflictState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.resolution = match next {
            ConflictState::ServerWins => Resolution::ServerWins,
            ConflictState::ClientWins => Resolution::ClientWins,
            ConflictState::Merged => Resolution::Merged,
            _ => self.resolution,
        };
        true
    }

    /// Apply a decision and, unless it parks the conflict, mark it resolved.
    pub fn apply(&mut self, outcome: &ResolutionOutcome) -> bool {
        if !self.transition(outcome.state()) {
            return false;
        }
        match outcome {
            ResolutionOutcome::AwaitingManual => true,
            _ => self.transition(ConflictState::Resolved),
        }
    }

    pub fn is_awaiting_manual(&self) -> bool {
        self.state == ConflictState::AwaitingManual
    }

    pub fn is_expired(&self, now: i64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.detected_at) >= i64::try_from(timeout_ms).unwrap_or(i64::MAX)
    }
}

/// Caller's answer to a parked conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "payload", rename_all = "kebab-case")]
pub enum ManualChoice {
    KeepServer,
    KeepClient,
    Merge(Value),
}

/// Applies a [`ConflictPolicy`] to local/remote snapshot pairs.
#[derive(Clone)]
pub struct ConflictResolver {
    default_policy: ConflictPolicy,
    class_policies: HashMap<String, ConflictPolicy>,
    merger: Arc<dyn MergeStrategy>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("default_policy", &self.default_policy)
            .field("class_policies", &self.class_policies)
            .finish_non_exhaustive()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictPolicy::default(), HashMap::new())
    }
}

impl ConflictResolver {
    pub fn new(default_policy: ConflictPolicy, class_policies: HashMap<String, ConflictPolicy>) -> Self {
        Self {
            default_policy,
            class_policies,
            merger: Arc::new(FieldMerge),
        }
    }

    #[must_use]
    pub fn with_merger(mut self, merger: Arc<dyn MergeStrategy>) -> Self {
        self.merger = merger;
        self
    }

    /// Swap policies, keeping the merge strategy (used on config reload).
    pub fn set_policies(&mut self, default_policy: ConflictPolicy, class_policies: HashMap<String, ConflictPolicy>) {
        self.default_policy = default_policy;
        self.class_policies = class_policies;
    }

    pub fn policy_for(&self, resource_class: Option<&str>) -> ConflictPolicy {
        resource_class
            .and_then(|class| self.class_policies.get(class))
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Decide a conflict. Performs no I/O.
    pub fn resolve(&self, local: &Snapshot, remote: &Snapshot, policy: ConflictPolicy) -> ResolutionOutcome {
        match policy {
            ConflictPolicy::ServerWins => ResolutionOutcome::ServerWins(remote.clone()),
            ConflictPolicy::ClientWins => ResolutionOutcome::ClientWins(local.clone()),
            ConflictPolicy::Manual => ResolutionOutcome::AwaitingManual,
            ConflictPolicy::Merge => self.merge(local, remote),
        }
    }

    /// Turn a manual choice into an outcome for `record`.
    pub fn resolve_manual(&self, record: &ConflictRecord, choice: ManualChoice) -> ResolutionOutcome {
        match choice {
            ManualChoice::KeepServer => ResolutionOutcome::ServerWins(record.remote_snapshot.clone()),
            ManualChoice::KeepClient => ResolutionOutcome::ClientWins(record.local_snapshot.clone()),
            ManualChoice::Merge(payload) => {
                ResolutionOutcome::Merged(Snapshot::new(payload, record.remote_snapshot.version))
            }
        }
    }

    fn merge(&self, local: &Snapshot, remote: &Snapshot) -> ResolutionOutcome {
        if local.deleted {
            // Nothing to merge into a delete
            return ResolutionOutcome::ClientWins(local.clone());
        }
        if remote.deleted {
            return ResolutionOutcome::Merged(Snapshot {
                payload: local.payload.clone(),
                version: remote.version,
                updated_at: now_millis(),
                deleted: false,
            });
        }
        ResolutionOutcome::Merged(self.merger.merge(local, remote))
    }
}

/// Whether `remote` already reflects `item` (e.g. the ack of an earlier
/// replay was lost before the item could be removed).
pub fn is_already_applied(item: &QueueItem, remote: &Snapshot) -> bool {
    if remote.version <= item.snapshot_version {
        return false;
    }
    match item.operation {
        Operation::Upsert => !remote.deleted && remote.payload == item.snapshot_payload,
        Operation::Delete => remote.deleted,
    }
}
