//! Local read/write API, conflict access and the remote-read write-back path.
//!
//! Writes never block on the network: they commit the entity and its queue
//! item in one batch and return. Propagation happens on a drain, either
//! spawned right away (online, `sync_on_write`) or on the next trigger.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::conflict::{ConflictRecord, ManualChoice, Resolution};
use crate::entity::{Entity, Snapshot};
use crate::error::{SyncError, SyncResult};
use crate::metrics::{self, LatencyTimer};
use crate::queue::QueueItem;
use crate::remote::RemoteError;
use crate::storage::local::{conflict_key, WriteBatch, CONFLICT_PREFIX};

use super::{SyncEngine, SyncEvent};

impl SyncEngine {
    /// Upsert `payload` under `id`.
    ///
    /// The new state is readable as soon as this returns, online or not.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use offline_sync::SyncEngine;
    /// # use serde_json::json;
    /// # async fn example(engine: &SyncEngine) -> offline_sync::SyncResult<()> {
    /// let entity = engine.write("todo.7", json!({"done": true})).await?;
    /// assert!(!entity.is_synced());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn write(&self, id: &str, payload: Value) -> SyncResult<Entity> {
        self.write_with_class(id, payload, None).await
    }

    /// Upsert with a resource class for routing and conflict policy.
    ///
    /// An existing entity keeps its class when `resource_class` is `None`.
    #[instrument(skip(self, payload))]
    pub async fn write_with_class(&self, id: &str, payload: Value, resource_class: Option<&str>) -> SyncResult<Entity> {
        let entity = {
            let _guard = self.store.lock(&[id]).await;
            let class = resource_class.map(str::to_string);
            let entity = match self.store.get_entity(id).await? {
                Some(existing) => {
                    let mut entity = existing.with_local_write(payload);
                    if class.is_some() {
                        entity.resource_class = class;
                    }
                    entity
                }
                None => Entity::new_local(id, payload, class),
            };

            let mut batch = WriteBatch::new();
            batch.put_entity(&entity)?;
            self.queue.enqueue_with(QueueItem::from_entity(&entity), batch).await?;
            entity
        };

        debug!(entity_id = id, revision = entity.revision, "Local write accepted");
        self.emit(SyncEvent::EntityUpdated(entity.clone()));
        self.after_local_change();
        Ok(entity)
    }

    /// Delete `id` locally and queue the remote delete.
    ///
    /// An entity that never reached the remote is dropped together with its
    /// queued items, with no remote traffic.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if there is no visible local entity.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        let tombstone = {
            let _guard = self.store.lock(&[id]).await;
            let Some(entity) = self.store.get_entity(id).await?.filter(Entity::is_visible) else {
                return Err(SyncError::not_found(id));
            };

            let mut batch = WriteBatch::new();
            if entity.remote_version == 0 {
                batch.delete_entity(id);
                let dropped = self.queue.discard_entity(id, batch).await?;
                debug!(entity_id = id, dropped, "Deleted unsynced entity locally");
                entity.with_local_delete()
            } else {
                let tombstone = entity.with_local_delete();
                batch.put_entity(&tombstone)?;
                self.queue.enqueue_with(QueueItem::from_entity(&tombstone), batch).await?;
                tombstone
            }
        };

        let queued = tombstone.remote_version > 0;
        self.emit(SyncEvent::EntityUpdated(tombstone));
        if queued {
            self.after_local_change();
        }
        Ok(())
    }

    fn after_local_change(&self) {
        if self.is_online() && self.config.read().sync_on_write {
            self.spawn_drain("write");
        }
    }

    /// Local state of `id`, if visible (tombstones read as absent).
    pub async fn get(&self, id: &str) -> SyncResult<Option<Entity>> {
        Ok(self.store.get_entity(id).await?.filter(Entity::is_visible))
    }

    /// All visible local entities.
    pub async fn entities(&self) -> SyncResult<Vec<Entity>> {
        let mut entities = self.store.scan_entities().await?;
        entities.retain(Entity::is_visible);
        Ok(entities)
    }

    /// Local state of `id` once no manual conflict is pending on it.
    ///
    /// # Errors
    ///
    /// - [`SyncError::ConflictUnresolved`] while a manual conflict awaits a choice
    /// - [`SyncError::NotFound`] if there is no visible local entity
    pub async fn resolved_entity(&self, id: &str) -> SyncResult<Entity> {
        if self.conflict(id).await?.is_some() {
            return Err(SyncError::ConflictUnresolved { key: id.to_string() });
        }
        self.get(id).await?.ok_or_else(|| SyncError::not_found(id))
    }

    pub async fn queue_size(&self) -> usize {
        self.queue.size().await
    }

    /// Conflicts parked for a manual choice.
    pub async fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        Ok(self
            .store
            .scan_json::<ConflictRecord>(CONFLICT_PREFIX)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    pub async fn conflict(&self, id: &str) -> SyncResult<Option<ConflictRecord>> {
        self.store.get_json(&conflict_key(id)).await
    }

    pub(super) async fn pending_conflicts(&self) -> usize {
        self.conflicts().await.map_or(0, |records| records.len())
    }

    /// Resume a parked conflict with the caller's choice.
    ///
    /// Keeping the server state is applied locally. Keeping the client state
    /// or a merged payload is queued for resubmission, so the decision
    /// survives going offline again.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotFound`] if no conflict is parked for `id`.
    #[instrument(skip(self, choice))]
    pub async fn resolve_conflict(&self, id: &str, choice: ManualChoice) -> SyncResult<Resolution> {
        let resolution = {
            let _guard = self.store.lock(&[id]).await;
            let Some(record) = self.conflict(id).await? else {
                return Err(SyncError::not_found(id));
            };
            let outcome = self.resolver.read().resolve_manual(&record, choice);
            self.apply_resolution(None, record, outcome).await?
        };

        if resolution != Resolution::ServerWins && self.is_online() {
            self.spawn_drain("resolution");
        }
        Ok(resolution)
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Fetch `id` from the remote, bounded by `timeout`.
    ///
    /// Fails fast with [`RemoteError::Unavailable`] while offline.
    pub(crate) async fn fetch_remote(&self, id: &str, timeout: Duration) -> Result<Option<Snapshot>, RemoteError> {
        if !self.is_online() {
            return Err(RemoteError::Unavailable("offline".to_string()));
        }
        let _timer = LatencyTimer::new("fetch");
        match tokio::time::timeout(timeout, self.remote.fetch(id)).await {
            Ok(result) => result,
            Err(_) => {
                metrics::record_timeout("fetch");
                Err(RemoteError::Timeout)
            }
        }
    }

    /// Write a fetched remote state back to the store.
    ///
    /// A pending or conflicted local entity is never overwritten; its visible
    /// state is returned instead. `None` means the remote has no such
    /// resource. Returns what a read should now see.
    pub(crate) async fn store_remote(
        &self,
        id: &str,
        resource_class: Option<String>,
        fetched: Option<Snapshot>,
    ) -> SyncResult<Option<Entity>> {
        let (visible, changed) = self
            .store
            .transaction(&[id], |txn| {
                let local = txn.entity(id).cloned();
                match (local, fetched) {
                    (Some(local), _) if !local.is_synced() => {
                        Ok((Some(local).filter(Entity::is_visible), None))
                    }
                    (Some(local), Some(remote)) => {
                        if remote.version < local.remote_version
                            || (remote.version == local.remote_version && remote.payload == local.payload)
                        {
                            return Ok((Some(local), None));
                        }
                        let updated = local.with_remote_state(&remote);
                        if updated.deleted {
                            txn.delete_entity(id);
                            return Ok((None, Some(updated)));
                        }
                        txn.put_entity(updated.clone())?;
                        Ok((Some(updated.clone()), Some(updated)))
                    }
                    (None, Some(remote)) if !remote.deleted => {
                        let created = Entity::from_remote(id, &remote, resource_class);
                        txn.put_entity(created.clone())?;
                        Ok((Some(created.clone()), Some(created)))
                    }
                    (Some(local), None) => {
                        // Gone remotely
                        txn.delete_entity(id);
                        let mut gone = local;
                        gone.deleted = true;
                        Ok((None, Some(gone)))
                    }
                    (None, _) => Ok((None, None)),
                }
            })
            .await?;

        if let Some(entity) = changed {
            debug!(entity_id = id, version = entity.version, deleted = entity.deleted, "Stored remote state");
            self.emit(SyncEvent::EntityUpdated(entity));
        }
        Ok(visible)
    }
}
