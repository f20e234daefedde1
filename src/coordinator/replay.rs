//! Queue replay: the single reconciliation path.
//!
//! Each queued item is submitted with its version precondition. The answer
//! decides what happens to the item and the local entity:
//!
//! | remote answer        | outcome                                       |
//! |----------------------|-----------------------------------------------|
//! | accepted             | entity confirmed, item removed                |
//! | 409 already applied  | same as accepted (lost ack)                   |
//! | 409                  | resolved by policy, or parked for manual      |
//! | 404 on delete        | already gone, item removed                    |
//! | other 4xx/5xx        | item dropped, entity rolled back, event       |
//! | transient / offline  | drain stops, item stays queued                |

use std::sync::atomic::Ordering;

use tracing::{debug, info, instrument, warn};

use crate::conflict::{is_already_applied, ConflictRecord, Resolution, ResolutionOutcome};
use crate::entity::{now_millis, Entity, Snapshot, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::metrics::{self, LatencyTimer};
use crate::queue::{DrainReport, Operation, QueueItem, ReplayOutcome, StopReason};
use crate::remote::RemoteError;
use crate::resilience::retry::retry_if;
use crate::storage::local::{conflict_key, WriteBatch, CONFLICT_PREFIX};

use super::{EngineState, SyncEngine, SyncEvent};

impl SyncEngine {
    /// Drain now, waiting for a running drain to finish first.
    ///
    /// Manual retry entry point. Uses the same path as every other trigger.
    #[instrument(skip(self))]
    pub async fn force_sync(&self) -> SyncResult<DrainReport> {
        let guard = self.drain_lock.lock().await;
        let report = self.run_drain("manual").await;
        drop(guard);
        self.follow_up_rerun();
        report
    }

    /// Drain unless one is already running, in which case the running drain
    /// is asked to go round once more and this returns a skipped report.
    pub(super) async fn trigger_drain(&self, trigger: &'static str) -> SyncResult<DrainReport> {
        let Ok(guard) = self.drain_lock.try_lock() else {
            self.rerun.store(true, Ordering::Release);
            debug!(trigger, "Drain already running, coalescing trigger");
            return Ok(DrainReport::skipped(self.queue.size().await));
        };
        let report = self.run_drain(trigger).await;
        drop(guard);
        self.follow_up_rerun();
        report
    }

    /// Caller must hold `drain_lock`.
    async fn run_drain(&self, trigger: &'static str) -> SyncResult<DrainReport> {
        loop {
            self.rerun.store(false, Ordering::Release);

            if !self.is_online() {
                return Ok(DrainReport {
                    remaining: self.queue.size().await,
                    stopped: Some(StopReason::Paused),
                    ..DrainReport::default()
                });
            }

            self.expire_manual_conflicts().await?;

            self.set_state(EngineState::Draining);
            self.emit(SyncEvent::SyncStarted);
            let queued = self.queue.size().await;
            info!(trigger, queued, "Sync started");

            let result = self.queue.drain(|item| self.replay(item)).await;

            self.set_state(if self.is_online() { EngineState::Idle } else { EngineState::Offline });
            let report = result?;
            self.emit(SyncEvent::SyncCompleted(report.clone()));

            // A reconnect that lands while a paused drain winds down asks
            // for another round too; only a transient stop waits for the
            // next trigger.
            let again = self.rerun.swap(false, Ordering::AcqRel);
            let resumable = report.is_complete() || report.stopped == Some(StopReason::Paused);
            if !again || !resumable || !self.is_online() {
                return Ok(report);
            }
            debug!(trigger, stopped = ?report.stopped, "Re-running drain for triggers that arrived meanwhile");
        }
    }

    /// Pick up a trigger that set `rerun` after the last check of a drain
    /// that has since released `drain_lock`.
    fn follow_up_rerun(&self) {
        if self.rerun.load(Ordering::Acquire) && self.is_online() {
            self.spawn_drain("rerun");
        }
    }

    async fn replay(&self, item: QueueItem) -> ReplayOutcome {
        if !self.is_online() {
            return ReplayOutcome::Paused;
        }

        let result = match self.submit(&item).await {
            Ok(snapshot) => self.confirm(&item, snapshot).await.map(|_| ReplayOutcome::Applied),
            Err(RemoteError::Conflict(remote)) => self.handle_conflict(&item, remote).await,
            Err(RemoteError::NotFound) if item.operation == Operation::Delete => {
                // Already gone remotely
                let tombstone = Snapshot::tombstone(item.snapshot_version + 1);
                self.confirm(&item, tombstone).await.map(|_| ReplayOutcome::AlreadySynced)
            }
            Err(e) if e.is_transient() => {
                return if self.is_online() {
                    ReplayOutcome::Retry(e.to_string())
                } else {
                    ReplayOutcome::Paused
                };
            }
            Err(e) => self.reject(&item, e).await,
        };

        result.unwrap_or_else(|e| {
            warn!(entity_id = %item.entity_id, error = %e, "Local write-back failed, item stays queued");
            ReplayOutcome::Retry(e.to_string())
        })
    }

    /// Send one item, retrying transient failures while online.
    async fn submit(&self, item: &QueueItem) -> Result<Snapshot, RemoteError> {
        let config = self.replay_retry();
        let name = match item.operation {
            Operation::Upsert => "replay_put",
            Operation::Delete => "replay_delete",
        };
        retry_if(
            name,
            &config,
            |e: &RemoteError| e.is_transient() && self.is_online(),
            || self.remote_call(item),
        )
        .await
    }

    async fn remote_call(&self, item: &QueueItem) -> Result<Snapshot, RemoteError> {
        let operation = match item.operation {
            Operation::Upsert => "put",
            Operation::Delete => "delete",
        };
        let _timer = LatencyTimer::new(operation);
        let call = async {
            match item.operation {
                Operation::Upsert => {
                    self.remote
                        .put(&item.entity_id, &item.snapshot_payload, item.precondition())
                        .await
                }
                Operation::Delete => self.remote.delete(&item.entity_id, item.precondition()).await,
            }
        };
        match tokio::time::timeout(self.network_timeout(), call).await {
            Ok(result) => result,
            Err(_) => {
                metrics::record_timeout(operation);
                Err(RemoteError::Timeout)
            }
        }
    }

    /// Record remote acceptance of `item` at `snapshot`.
    async fn confirm(&self, item: &QueueItem, snapshot: Snapshot) -> SyncResult<()> {
        let id = item.entity_id.as_str();
        let _guard = self.store.lock(&[id]).await;
        let local = self.store.get_entity(id).await?;

        let mut batch = WriteBatch::new();
        let mut follow_up = None;
        let updated = match local {
            // A newer local write is queued behind this one
            Some(entity) if entity.revision > item.revision && !entity.is_synced() => {
                entity.rebased_onto(snapshot.version)
            }
            Some(entity) => {
                let mut entity = entity.confirmed_at(snapshot.version);
                entity.deleted = snapshot.deleted;
                entity
            }
            // Discarded locally while the create was in flight
            None if !snapshot.deleted => {
                let tombstone = Entity::from_remote(id, &snapshot, item.resource_class.clone()).with_local_delete();
                follow_up = Some(QueueItem::from_entity(&tombstone));
                tombstone
            }
            None => Entity::from_remote(id, &snapshot, item.resource_class.clone()),
        };

        if updated.deleted && updated.is_synced() {
            batch.delete_entity(id);
        } else {
            batch.put_entity(&updated)?;
        }
        self.queue
            .settle(id, Some(item), Some(snapshot.version), follow_up, batch)
            .await?;

        debug!(entity_id = id, version = snapshot.version, state = %updated.sync_state, "Mutation confirmed");
        self.emit(SyncEvent::EntityUpdated(updated));
        Ok(())
    }

    async fn handle_conflict(&self, item: &QueueItem, remote: Snapshot) -> SyncResult<ReplayOutcome> {
        if is_already_applied(item, &remote) {
            debug!(entity_id = %item.entity_id, version = remote.version, "Remote already has this mutation");
            self.confirm(item, remote).await?;
            return Ok(ReplayOutcome::AlreadySynced);
        }

        let (policy, outcome, record) = {
            let resolver = self.resolver.read();
            let policy = resolver.policy_for(item.resource_class.as_deref());
            let record = ConflictRecord::new(item, remote);
            let outcome = resolver.resolve(&record.local_snapshot, &record.remote_snapshot, policy);
            (policy, outcome, record)
        };

        metrics::record_conflict(policy.as_str());
        info!(
            entity_id = %item.entity_id,
            base = item.snapshot_version,
            remote = record.remote_snapshot.version,
            %policy,
            "Conflict detected"
        );
        self.emit(SyncEvent::ConflictDetected(record.clone()));

        let _guard = self.store.lock(&[&item.entity_id]).await;
        let resolution = self.apply_resolution(Some(item), record, outcome).await?;
        Ok(match resolution {
            Resolution::Unresolved => ReplayOutcome::AwaitingManual,
            resolved => ReplayOutcome::Conflict(resolved),
        })
    }

    /// Carry out a resolution. Caller must hold the entity lock.
    ///
    /// `parked` is the queue item that hit the conflict (None when resuming a
    /// parked manual conflict).
    pub(super) async fn apply_resolution(
        &self,
        parked: Option<&QueueItem>,
        mut record: ConflictRecord,
        outcome: ResolutionOutcome,
    ) -> SyncResult<Resolution> {
        if !record.apply(&outcome) {
            warn!(entity_id = %record.entity_id, from = ?record.state, to = ?outcome.state(), "Ignoring invalid conflict transition");
        }
        let id = record.entity_id.clone();
        let class = record.resource_class.clone();
        let local = self.store.get_entity(&id).await?;
        let remote_version = record.remote_snapshot.version;
        let mut batch = WriteBatch::new();

        match &outcome {
            ResolutionOutcome::ServerWins(remote) => {
                batch.delete(conflict_key(&id));
                let entity = match local {
                    Some(entity) => entity.with_remote_state(remote),
                    None => Entity::from_remote(&id, remote, class),
                };
                if entity.deleted {
                    batch.delete_entity(&id);
                } else {
                    batch.put_entity(&entity)?;
                }
                // Local pending mutations for the entity are discarded
                self.queue.discard_entity(&id, batch).await?;
                self.emit(SyncEvent::EntityUpdated(entity));
            }

            ResolutionOutcome::ClientWins(snapshot) | ResolutionOutcome::Merged(snapshot) => {
                batch.delete(conflict_key(&id));
                let force = matches!(outcome, ResolutionOutcome::ClientWins(_));
                let newer_pending = self
                    .queue
                    .items_for(&id)
                    .await
                    .iter()
                    .any(|queued| parked.map_or(true, |p| p.id != queued.id));

                let base = match local {
                    Some(entity) => entity,
                    None => Entity::from_remote(&id, &record.remote_snapshot, class),
                };
                let entity = if newer_pending {
                    // Later local writes supersede the resolution
                    base.rebased_onto(remote_version)
                } else {
                    let rebased = base.rebased_onto(remote_version);
                    if snapshot.deleted {
                        rebased.with_local_delete()
                    } else {
                        rebased.with_local_write(snapshot.payload.clone())
                    }
                };

                let resubmit = Snapshot {
                    payload: snapshot.payload.clone(),
                    version: remote_version,
                    updated_at: now_millis(),
                    deleted: snapshot.deleted,
                };
                let follow_up = QueueItem::resubmission(&entity, &resubmit, force);
                batch.put_entity(&entity)?;
                self.queue
                    .settle(&id, parked, Some(remote_version), Some(follow_up), batch)
                    .await?;
                self.emit(SyncEvent::EntityUpdated(entity));
            }

            ResolutionOutcome::AwaitingManual => {
                batch.put_json(conflict_key(&id), &record)?;
                if let Some(mut entity) = local {
                    entity.sync_state = SyncState::Conflicted;
                    batch.put_entity(&entity)?;
                }
                self.queue.settle(&id, parked, None, None, batch).await?;
                metrics::set_pending_conflicts(self.pending_conflicts().await);
                info!(entity_id = %id, "Conflict parked for manual resolution");
                return Ok(Resolution::Unresolved);
            }
        }

        metrics::set_pending_conflicts(self.pending_conflicts().await);
        info!(entity_id = %id, resolution = ?record.resolution, "Conflict resolved");
        let resolution = record.resolution;
        self.emit(SyncEvent::ConflictResolved(record));
        Ok(resolution)
    }

    /// Drop a rejected item and roll the entity back to its confirmed state.
    async fn reject(&self, item: &QueueItem, error: RemoteError) -> SyncResult<ReplayOutcome> {
        let status = error.status().unwrap_or(0);
        let message = error.to_string();
        let id = item.entity_id.as_str();
        warn!(entity_id = id, status, %message, "Remote rejected queued mutation, dropping it");

        let rolled_back = {
            let _guard = self.store.lock(&[id]).await;
            let local = self.store.get_entity(id).await?;
            let newer_pending = self.queue.items_for(id).await.iter().any(|queued| queued.id != item.id);

            let mut batch = WriteBatch::new();
            let rolled_back = match local {
                Some(entity) if !newer_pending => {
                    if entity.remote_version == 0 {
                        // Never existed remotely
                        batch.delete_entity(id);
                        None
                    } else {
                        let confirmed = entity.remote_version;
                        let mut entity = entity.confirmed_at(confirmed);
                        entity.deleted = false;
                        batch.put_entity(&entity)?;
                        Some(entity)
                    }
                }
                _ => None,
            };
            self.queue.settle(id, Some(item), None, None, batch).await?;
            rolled_back
        };

        self.emit(SyncEvent::ItemRejected {
            entity_id: id.to_string(),
            status,
            message: message.clone(),
        });

        if let Some(entity) = rolled_back {
            self.emit(SyncEvent::EntityUpdated(entity));
            // Payload is still the rejected one; pull the confirmed state
            if let Err(e) = self.refresh(id, item.resource_class.clone()).await {
                debug!(entity_id = id, error = %e, "Refresh after rejection failed");
            }
        }

        Ok(ReplayOutcome::Rejected { status, message })
    }

    /// Fetch remote state and store it unless a local mutation is pending.
    async fn refresh(&self, id: &str, class: Option<String>) -> SyncResult<()> {
        let fetched = self
            .fetch_remote(id, self.network_timeout())
            .await
            .map_err(|e| SyncError::unavailable(id, e))?;
        self.store_remote(id, class, fetched).await?;
        Ok(())
    }

    /// Resolve manual conflicts older than the configured timeout server-wins.
    async fn expire_manual_conflicts(&self) -> SyncResult<()> {
        let Some(timeout_ms) = self.config.read().manual_conflict_timeout_ms else {
            return Ok(());
        };

        let now = now_millis();
        let expired: Vec<String> = self
            .store
            .scan_json::<ConflictRecord>(CONFLICT_PREFIX)
            .await?
            .into_iter()
            .filter(|(_, record)| record.is_awaiting_manual() && record.is_expired(now, timeout_ms))
            .map(|(_, record)| record.entity_id)
            .collect();

        for id in expired {
            let _guard = self.store.lock(&[&id]).await;
            // Re-read under the lock; it may have been resolved meanwhile
            let Some(record) = self.store.get_json::<ConflictRecord>(&conflict_key(&id)).await? else {
                continue;
            };
            info!(entity_id = %id, timeout_ms, "Manual conflict timed out, applying server-wins");
            let outcome = ResolutionOutcome::ServerWins(record.remote_snapshot.clone());
            self.apply_resolution(None, record, outcome).await?;
        }
        Ok(())
    }
}
