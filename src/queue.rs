//! Durable queue of pending mutations.
//!
//! Every accepted local write lands here (in the same atomic commit as the
//! entity itself) and stays until a replay settles it. Records are stored
//! under `queue/{seq:020}` so a key-ordered scan yields enqueue order, and
//! each record carries a SHA-256 checksum that is verified on load.
//!
//! # Coalescing
//!
//! With coalescing on, a new mutation for an entity that already has a
//! queued item replaces that item's content in place: the queue position
//! (`seq`) of the oldest entry is kept, so a busy entity cannot starve the
//! ones queued behind it. See [`coalesce_items`].
//!
//! # Drain
//!
//! [`SyncQueue::drain`] walks the queue in order and hands each item to a
//! replay function. It re-reads the queue at every step instead of
//! snapshotting it, so items enqueued during a drain are picked up by that
//! same drain. A transient failure stops the walk and leaves the item (and
//! everything after it) queued.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conflict::Resolution;
use crate::entity::{now_millis, Entity, Snapshot};
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::remote::Precondition;
use crate::resilience::drain::{DrainFlag, DrainStats};
use crate::storage::local::{queue_key, LocalStore, WriteBatch, QUEUE_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Upsert,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Identity of this content; a coalesced replacement gets a fresh id
    pub id: Uuid,
    /// Durable queue position (0 until enqueued)
    pub seq: u64,
    pub entity_id: String,
    pub operation: Operation,
    pub snapshot_payload: Value,
    /// Remote version the mutation was derived from
    pub snapshot_version: u64,
    /// Entity revision that produced this content
    pub revision: u64,
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<String>,
    /// Submit without a version precondition
    #[serde(default)]
    pub force: bool,
}

impl QueueItem {
    /// Capture the pending state of `entity`.
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            entity_id: entity.id.clone(),
            operation: if entity.deleted { Operation::Delete } else { Operation::Upsert },
            snapshot_payload: entity.payload.clone(),
            snapshot_version: entity.remote_version,
            revision: entity.revision,
            enqueued_at: now_millis(),
            resource_class: entity.resource_class.clone(),
            force: false,
        }
    }

    /// Resubmission of a conflict resolution.
    pub fn resubmission(entity: &Entity, snapshot: &Snapshot, force: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            entity_id: entity.id.clone(),
            operation: if snapshot.deleted { Operation::Delete } else { Operation::Upsert },
            snapshot_payload: snapshot.payload.clone(),
            snapshot_version: snapshot.version,
            revision: entity.revision,
            enqueued_at: now_millis(),
            resource_class: entity.resource_class.clone(),
            force,
        }
    }

    /// The local side of this mutation, at the version it will carry once applied.
    pub fn local_snapshot(&self) -> Snapshot {
        Snapshot {
            payload: self.snapshot_payload.clone(),
            version: self.snapshot_version + 1,
            updated_at: self.enqueued_at,
            deleted: self.operation == Operation::Delete,
        }
    }

    pub fn precondition(&self) -> Precondition {
        if self.force {
            Precondition::Force
        } else {
            Precondition::IfVersion(self.snapshot_version)
        }
    }
}

/// Fold a newer mutation for the same entity into an older one.
///
/// The result sits at the older item's queue position and keeps its enqueue
/// time; everything else (operation, payload, identity) comes from the newer
/// item, so a later delete always replaces an earlier upsert and vice versa.
/// The base version is the larger of the two, and `force` survives if either
/// side carried it.
pub fn coalesce_items(older: &QueueItem, newer: &QueueItem) -> QueueItem {
    QueueItem {
        id: newer.id,
        seq: older.seq,
        entity_id: newer.entity_id.clone(),
        operation: newer.operation,
        snapshot_payload: newer.snapshot_payload.clone(),
        snapshot_version: older.snapshot_version.max(newer.snapshot_version),
        revision: older.revision.max(newer.revision),
        enqueued_at: older.enqueued_at,
        resource_class: newer.resource_class.clone().or_else(|| older.resource_class.clone()),
        force: older.force || newer.force,
    }
}

/// Persisted form of a queue item.
///
/// `body` is the item's JSON text, checksummed verbatim.
#[derive(Debug, Serialize, Deserialize)]
struct QueueRecord {
    checksum: String,
    body: String,
}

impl QueueRecord {
    fn seal(item: &QueueItem) -> SyncResult<Self> {
        let body = serde_json::to_string(item)?;
        Ok(Self {
            checksum: checksum(&body),
            body,
        })
    }

    fn open(key: &str, bytes: &[u8]) -> SyncResult<QueueItem> {
        let record: QueueRecord = serde_json::from_slice(bytes)
            .map_err(|e| corrupt(key, format!("undecodable record: {e}")))?;

        if checksum(&record.body) != record.checksum {
            return Err(corrupt(key, "checksum mismatch".to_string()));
        }

        let item: QueueItem = serde_json::from_str(&record.body)
            .map_err(|e| corrupt(key, format!("undecodable item: {e}")))?;

        if queue_key(item.seq) != key {
            return Err(corrupt(key, format!("stored under wrong key for seq {}", item.seq)));
        }
        Ok(item)
    }
}

fn checksum(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

fn corrupt(key: &str, detail: String) -> SyncError {
    metrics::record_corruption(key);
    SyncError::QueueCorrupt(format!("{key}: {detail}"))
}

/// What a replay did with one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// Remote accepted the mutation
    Applied,
    /// Remote already reflected the mutation
    AlreadySynced,
    /// Version mismatch settled by policy
    Conflict(Resolution),
    /// Version mismatch parked for a manual choice
    AwaitingManual,
    /// Terminal non-conflict rejection
    Rejected { status: u16, message: String },
    /// Transient failure: stop and keep the item
    Retry(String),
    /// Connectivity lost: stop and keep the item
    Paused,
}

impl ReplayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadySynced => "already-synced",
            Self::Conflict(_) => "conflict",
            Self::AwaitingManual => "awaiting-manual",
            Self::Rejected { .. } => "rejected",
            Self::Retry(_) => "retry",
            Self::Paused => "paused",
        }
    }

    /// Whether the drain should stop at this item.
    pub fn halts_drain(&self) -> bool {
        matches!(self, Self::Retry(_) | Self::Paused)
    }
}

/// Why a drain stopped before reaching the end of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum StopReason {
    Transient(String),
    Paused,
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub applied: usize,
    pub already_synced: usize,
    pub conflicts: usize,
    pub awaiting_manual: usize,
    pub rejected: usize,
    /// Items left in the queue when the drain ended
    pub remaining: usize,
    pub stopped: Option<StopReason>,
    /// Another drain was already running; nothing was attempted
    pub skipped: bool,
}

impl DrainReport {
    pub fn skipped(remaining: usize) -> Self {
        Self {
            remaining,
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.skipped && self.stopped.is_none()
    }

    fn record(&mut self, outcome: &ReplayOutcome) {
        self.attempted += 1;
        match outcome {
            ReplayOutcome::Applied => self.applied += 1,
            ReplayOutcome::AlreadySynced => self.already_synced += 1,
            ReplayOutcome::Conflict(_) => self.conflicts += 1,
            ReplayOutcome::AwaitingManual => self.awaiting_manual += 1,
            ReplayOutcome::Rejected { .. } => self.rejected += 1,
            ReplayOutcome::Retry(reason) => self.stopped = Some(StopReason::Transient(reason.clone())),
            ReplayOutcome::Paused => self.stopped = Some(StopReason::Paused),
        }
    }
}

/// Result of [`SyncQueue::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    /// The replayed item was still current and has been removed
    pub removed: bool,
    /// Newer items for the entity remain queued
    pub superseded: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    items: BTreeMap<u64, QueueItem>,
    next_seq: u64,
}

impl QueueState {
    fn seqs_for(&self, entity_id: &str) -> Vec<u64> {
        self.items
            .values()
            .filter(|item| item.entity_id == entity_id)
            .map(|item| item.seq)
            .collect()
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Durable FIFO of pending mutations with per-entity coalescing.
pub struct SyncQueue {
    store: Arc<LocalStore>,
    /// In-memory mirror of the durable records, updated only after a commit
    state: Mutex<QueueState>,
    coalescing: AtomicBool,
    drain_flag: DrainFlag,
}

impl SyncQueue {
    /// Load and verify the durable queue.
    ///
    /// # Errors
    ///
    /// [`SyncError::QueueCorrupt`] if any record fails its integrity check.
    pub async fn open(store: Arc<LocalStore>, coalescing: bool) -> SyncResult<Self> {
        let mut items = BTreeMap::new();
        for (key, bytes) in store.scan_raw(QUEUE_PREFIX).await? {
            let item = QueueRecord::open(&key, &bytes).map_err(|e| {
                error!(key = %key, error = %e, "Queue integrity check failed");
                e
            })?;
            items.insert(item.seq, item);
        }

        let next_seq = items.keys().next_back().map_or(1, |seq| seq + 1);
        if !items.is_empty() {
            info!(pending = items.len(), "Queue has items from previous run, will replay");
        }
        metrics::set_queue_depth(items.len());

        Ok(Self {
            store,
            state: Mutex::new(QueueState { items, next_seq }),
            coalescing: AtomicBool::new(coalescing),
            drain_flag: DrainFlag::new(),
        })
    }

    pub fn set_coalescing(&self, enabled: bool) {
        self.coalescing.store(enabled, Ordering::Release);
    }

    pub fn coalescing(&self) -> bool {
        self.coalescing.load(Ordering::Acquire)
    }

    /// Durably append `item` and return its id.
    pub async fn enqueue(&self, item: QueueItem) -> SyncResult<Uuid> {
        Ok(self.enqueue_with(item, WriteBatch::new()).await?.id)
    }

    /// Durably append `item`, committing `batch` in the same atomic write.
    ///
    /// Returns the item as stored (with its queue position, and merged with
    /// the entity's existing item if coalescing applied).
    pub async fn enqueue_with(&self, item: QueueItem, mut batch: WriteBatch) -> SyncResult<QueueItem> {
        let mut state = self.state.lock().await;
        let existing = state.seqs_for(&item.entity_id);

        let collapsed = if self.coalescing() {
            Self::collapse(&state, &existing, Some(&item))
        } else {
            None
        };
        let coalesced = collapsed.is_some();
        let (stored, removed) = match collapsed {
            Some(found) => found,
            None => {
                let mut item = item;
                item.seq = state.allocate_seq();
                (item, Vec::new())
            }
        };

        batch.put_json(queue_key(stored.seq), &QueueRecord::seal(&stored)?)?;
        for seq in &removed {
            batch.delete(queue_key(*seq));
        }
        self.store.commit(batch).await?;

        for seq in &removed {
            state.items.remove(seq);
        }
        state.items.insert(stored.seq, stored.clone());
        metrics::record_enqueue(coalesced);
        metrics::set_queue_depth(state.items.len());

        debug!(
            entity_id = %stored.entity_id,
            seq = stored.seq,
            operation = stored.operation.as_str(),
            queued = state.items.len(),
            "Mutation queued"
        );
        Ok(stored)
    }

    /// Collapse every queued item for `entity_id` into one.
    ///
    /// Returns the surviving item, if any.
    pub async fn coalesce(&self, entity_id: &str) -> SyncResult<Option<QueueItem>> {
        let mut state = self.state.lock().await;
        let existing = state.seqs_for(entity_id);
        if existing.len() < 2 {
            return Ok(existing.first().and_then(|seq| state.items.get(seq)).cloned());
        }

        let Some((merged, removed)) = Self::collapse(&state, &existing, None) else {
            return Ok(None);
        };
        let mut batch = WriteBatch::new();
        batch.put_json(queue_key(merged.seq), &QueueRecord::seal(&merged)?)?;
        for seq in &removed {
            batch.delete(queue_key(*seq));
        }
        self.store.commit(batch).await?;

        for seq in &removed {
            state.items.remove(seq);
        }
        state.items.insert(merged.seq, merged.clone());
        metrics::set_queue_depth(state.items.len());

        debug!(entity_id, collapsed = removed.len() + 1, "Coalesced queued mutations");
        Ok(Some(merged))
    }

    /// Fold the items at `seqs` (ascending) plus an optional newcomer into
    /// one; returns it with the seqs that must be deleted. `None` if `seqs`
    /// holds no queued item.
    fn collapse(state: &QueueState, seqs: &[u64], newcomer: Option<&QueueItem>) -> Option<(QueueItem, Vec<u64>)> {
        let mut items = seqs.iter().filter_map(|seq| state.items.get(seq));
        let mut merged = items.next()?.clone();
        for newer in items.chain(newcomer) {
            merged = coalesce_items(&merged, newer);
        }
        let removed = seqs.iter().copied().filter(|seq| *seq != merged.seq).collect();
        Some((merged, removed))
    }

    /// Settle a replayed item (or a parked conflict, with `done = None`)
    /// together with the entity writes in `batch`.
    ///
    /// The item is removed only if it is still current (not replaced by a
    /// coalesced write meanwhile). Any other queued items for the entity are
    /// rebased onto `rebase_to`, the remote version just established. A
    /// `follow_up` (a resolution that must still reach the remote) is queued
    /// only if no newer item for the entity remains.
    pub async fn settle(
        &self,
        entity_id: &str,
        done: Option<&QueueItem>,
        rebase_to: Option<u64>,
        follow_up: Option<QueueItem>,
        mut batch: WriteBatch,
    ) -> SyncResult<Settled> {
        let mut state = self.state.lock().await;

        let done_seq = done
            .filter(|done| state.items.get(&done.seq).is_some_and(|current| current.id == done.id))
            .map(|done| done.seq);
        let removed = done_seq.is_some();
        if let Some(seq) = done_seq {
            batch.delete(queue_key(seq));
        }

        let mut remaining = Vec::new();
        for seq in state.seqs_for(entity_id) {
            if done_seq == Some(seq) {
                continue;
            }
            let Some(item) = state.items.get(&seq) else { continue };
            let mut item = item.clone();
            if let Some(version) = rebase_to.filter(|v| *v > item.snapshot_version) {
                item.snapshot_version = version;
                batch.put_json(queue_key(seq), &QueueRecord::seal(&item)?)?;
            }
            remaining.push(item);
        }
        let superseded = !remaining.is_empty();

        let follow_up = match follow_up {
            Some(mut item) if !superseded => {
                item.seq = state.allocate_seq();
                batch.put_json(queue_key(item.seq), &QueueRecord::seal(&item)?)?;
                Some(item)
            }
            _ => None,
        };

        self.store.commit(batch).await?;

        if let Some(seq) = done_seq {
            state.items.remove(&seq);
        }
        for item in remaining {
            state.items.insert(item.seq, item);
        }
        if let Some(item) = follow_up {
            debug!(entity_id = %item.entity_id, seq = item.seq, force = item.force, "Resolution re-queued");
            state.items.insert(item.seq, item);
        }
        self.drain_flag.record_settled(u64::from(removed));
        metrics::set_queue_depth(state.items.len());

        Ok(Settled { removed, superseded })
    }

    /// Drop every queued item for `entity_id`, committing `batch` with it.
    ///
    /// Returns how many items were dropped.
    pub async fn discard_entity(&self, entity_id: &str, mut batch: WriteBatch) -> SyncResult<usize> {
        let mut state = self.state.lock().await;
        let seqs = state.seqs_for(entity_id);
        for seq in &seqs {
            batch.delete(queue_key(*seq));
        }
        self.store.commit(batch).await?;

        for seq in &seqs {
            state.items.remove(seq);
        }
        self.drain_flag.record_settled(seqs.len() as u64);
        metrics::set_queue_depth(state.items.len());
        Ok(seqs.len())
    }

    /// First item at or after `seq`.
    pub async fn peek_from(&self, seq: u64) -> Option<QueueItem> {
        let state = self.state.lock().await;
        state.items.range(seq..).next().map(|(_, item)| item.clone())
    }

    /// Queued items for one entity, oldest first.
    pub async fn items_for(&self, entity_id: &str) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        state.items.values().filter(|item| item.entity_id == entity_id).cloned().collect()
    }

    /// All queued items in order.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.state.lock().await.items.values().cloned().collect()
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub fn is_draining(&self) -> bool {
        self.drain_flag.is_draining()
    }

    pub fn stats(&self) -> DrainStats {
        self.drain_flag.stats()
    }

    /// Replay queued items in order.
    ///
    /// `replay` is expected to settle the item itself (so entity writes can
    /// join the same commit). An item a terminal outcome leaves behind is
    /// removed here, so a drain never revisits it. If another drain is
    /// running this returns a skipped report immediately.
    pub async fn drain<F, Fut>(&self, mut replay: F) -> SyncResult<DrainReport>
    where
        F: FnMut(QueueItem) -> Fut,
        Fut: Future<Output = ReplayOutcome>,
    {
        let Some(_guard) = self.drain_flag.try_begin() else {
            debug!("Drain already in progress");
            return Ok(DrainReport::skipped(self.size().await));
        };

        let started = Instant::now();
        let mut report = DrainReport::default();
        let mut seen = HashSet::new();
        let mut cursor = 0;

        while let Some(item) = self.peek_from(cursor).await {
            if !seen.insert(item.id) {
                // Replayed already and still here; look past it
                cursor = item.seq + 1;
                continue;
            }

            let seq = item.seq;
            let id = item.id;
            let outcome = replay(item).await;
            metrics::record_replay(outcome.label());
            report.record(&outcome);

            if outcome.halts_drain() {
                warn!(seq, outcome = outcome.label(), "Drain stopped, remaining items stay queued");
                break;
            }
            self.remove_if_current(seq, id).await?;
            // Inclusive: a coalesced replacement at the same position is replayed next
            cursor = seq;
        }

        report.remaining = self.size().await;
        metrics::record_drain(report.attempted, report.remaining, started.elapsed());
        info!(
            attempted = report.attempted,
            applied = report.applied,
            conflicts = report.conflicts,
            rejected = report.rejected,
            remaining = report.remaining,
            "Drain finished"
        );
        Ok(report)
    }

    async fn remove_if_current(&self, seq: u64, id: Uuid) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        if !state.items.get(&seq).is_some_and(|item| item.id == id) {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        batch.delete(queue_key(seq));
        self.store.commit(batch).await?;
        state.items.remove(&seq);
        self.drain_flag.record_settled(1);
        metrics::set_queue_depth(state.items.len());
        Ok(())
    }
}
