//! Typed, per-key serialized access to the durable store.
//!
//! [`LocalStore`] is the only way the engine touches persistent state. It
//! namespaces keys, encodes records as JSON, and provides
//! [`transaction`](LocalStore::transaction): lock the keys, read, decide,
//! commit atomically. Two read-modify-write sequences on the same entity can
//! therefore never interleave; different entities proceed concurrently.
//!
//! Key layout:
//!
//! ```text
//! entity/{id}         → Entity
//! queue/{seq:020}     → QueueRecord (checksummed)
//! conflict/{id}       → ConflictRecord
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::traits::{DurableStore, StorageError, WriteOp};
use crate::entity::Entity;
use crate::error::SyncError;

pub const ENTITY_PREFIX: &str = "entity/";
pub const QUEUE_PREFIX: &str = "queue/";
pub const CONFLICT_PREFIX: &str = "conflict/";

pub fn entity_key(id: &str) -> String {
    format!("{ENTITY_PREFIX}{id}")
}

pub fn queue_key(seq: u64) -> String {
    format!("{QUEUE_PREFIX}{seq:020}")
}

pub fn conflict_key(id: &str) -> String {
    format!("{CONFLICT_PREFIX}{id}")
}

/// Writes staged for one atomic commit.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_json<T: Serialize>(&mut self, key: String, value: &T) -> Result<&mut Self, SyncError> {
        let value = serde_json::to_vec(value)?;
        self.ops.push(WriteOp::Put { key, value });
        Ok(self)
    }

    pub fn put_entity(&mut self, entity: &Entity) -> Result<&mut Self, SyncError> {
        self.put_json(entity_key(&entity.id), entity)
    }

    pub fn delete(&mut self, key: String) -> &mut Self {
        self.ops.push(WriteOp::Delete { key });
        self
    }

    pub fn delete_entity(&mut self, id: &str) -> &mut Self {
        self.delete(entity_key(id))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Per-key async locks, acquired in sorted order to rule out lock cycles.
///
/// An entry lives only while some guard holds or awaits it.
#[derive(Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the locks for a set of keys until dropped.
pub struct KeyGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guards: Vec<(String, OwnedMutexGuard<()>)>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        for (key, guard) in self.guards.drain(..) {
            drop(guard);
            // Only the map's own handle left: nobody holds or waits on it
            self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

impl KeyLocks {
    pub async fn lock(&self, keys: &[&str]) -> KeyGuard {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guard = KeyGuard {
            locks: self.locks.clone(),
            guards: Vec::with_capacity(sorted.len()),
        };
        for key in sorted {
            // Clone the Arc out so no map shard stays locked across the await
            let lock = self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let held = lock.lock_owned().await;
            guard.guards.push((key.to_string(), held));
        }
        guard
    }

    /// Number of keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Staging area handed to a [`LocalStore::transaction`] closure.
pub struct Transaction {
    entities: HashMap<String, Option<Entity>>,
    batch: WriteBatch,
}

impl Transaction {
    /// Current entity state for a locked id (reflecting earlier staged writes).
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id).and_then(Option::as_ref)
    }

    pub fn put_entity(&mut self, entity: Entity) -> Result<(), SyncError> {
        self.batch.put_entity(&entity)?;
        self.entities.insert(entity.id.clone(), Some(entity));
        Ok(())
    }

    pub fn delete_entity(&mut self, id: &str) {
        self.batch.delete_entity(id);
        self.entities.insert(id.to_string(), None);
    }
}

/// The engine's adapter over a [`DurableStore`].
pub struct LocalStore {
    backend: Arc<dyn DurableStore>,
    locks: KeyLocks,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn DurableStore>) -> Self {
        Self {
            backend,
            locks: KeyLocks::default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DurableStore> {
        &self.backend
    }

    /// Serialize against other writers of these entity ids.
    ///
    /// Not reentrant: never call [`transaction`](Self::transaction) for an id
    /// while holding its guard.
    pub async fn lock(&self, ids: &[&str]) -> KeyGuard {
        self.locks.lock(ids).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SyncError> {
        match self.backend.get(key).await? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn scan_raw(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, SyncError> {
        Ok(self.backend.scan(prefix).await?)
    }

    pub async fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>, SyncError> {
        self.backend
            .scan(prefix)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let value = decode(&key, &bytes)?;
                Ok((key, value))
            })
            .collect()
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>, SyncError> {
        self.get_json(&entity_key(id)).await
    }

    pub async fn scan_entities(&self) -> Result<Vec<Entity>, SyncError> {
        Ok(self
            .scan_json::<Entity>(ENTITY_PREFIX)
            .await?
            .into_iter()
            .map(|(_, entity)| entity)
            .collect())
    }

    /// Commit staged writes atomically.
    pub async fn commit(&self, batch: WriteBatch) -> Result<(), SyncError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.apply(batch.into_ops()).await?;
        Ok(())
    }

    /// Lock `ids`, load their entities, run `f` against the staging view and
    /// commit whatever it staged as one atomic batch.
    ///
    /// If `f` returns an error nothing is written.
    pub async fn transaction<T, F>(&self, ids: &[&str], f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Transaction) -> Result<T, SyncError>,
    {
        let _guard = self.lock(ids).await;

        let mut entities = HashMap::with_capacity(ids.len());
        for id in ids {
            entities.insert(id.to_string(), self.get_entity(id).await?);
        }

        let mut txn = Transaction {
            entities,
            batch: WriteBatch::new(),
        };
        let result = f(&mut txn)?;
        self.commit(txn.batch).await?;
        Ok(result)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, SyncError> {
    serde_json::from_slice(bytes).map_err(|e| {
        SyncError::Storage(StorageError::Corruption {
            key: key.to_string(),
            detail: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SyncState;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn local_store() -> LocalStore {
        LocalStore::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(entity_key("a.b"), "entity/a.b");
        assert_eq!(queue_key(42), "queue/00000000000000000042");
        assert_eq!(conflict_key("a.b"), "conflict/a.b");
        // zero padding keeps lexical order == numeric order
        assert!(queue_key(9) < queue_key(10));
    }

    #[tokio::test]
    async fn test_transaction_commits_staged_writes() {
        let store = local_store();

        store
            .transaction(&["n.1"], |txn| {
                assert!(txn.entity("n.1").is_none());
                txn.put_entity(Entity::new_local("n.1", json!("v1"), None))?;
                assert!(txn.entity("n.1").is_some());
                Ok(())
            })
            .await
            .unwrap();

        let entity = store.get_entity("n.1").await.unwrap().unwrap();
        assert_eq!(entity.payload, json!("v1"));
        assert_eq!(entity.sync_state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_transaction_error_writes_nothing() {
        let store = local_store();

        let result: Result<(), SyncError> = store
            .transaction(&["n.1"], |txn| {
                txn.put_entity(Entity::new_local("n.1", json!("v1"), None))?;
                Err(SyncError::not_found("n.1"))
            })
            .await;

        assert!(result.is_err());
        assert!(store.get_entity("n.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_delete() {
        let store = local_store();
        let mut batch = WriteBatch::new();
        batch.put_entity(&Entity::new_local("n.1", json!(1), None)).unwrap();
        store.commit(batch).await.unwrap();

        store
            .transaction(&["n.1"], |txn| {
                txn.delete_entity("n.1");
                assert!(txn.entity("n.1").is_none());
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.get_entity("n.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_storage_error() {
        let store = local_store();
        store.backend().put("entity/bad", b"{not json".to_vec()).await.unwrap();

        let err = store.get_entity("bad").await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(StorageError::Corruption { .. })));
    }

    #[tokio::test]
    async fn test_same_key_read_modify_write_is_serialized() {
        let store = Arc::new(local_store());
        let mut batch = WriteBatch::new();
        batch.put_json(entity_key("counter"), &Entity::new_local("counter", json!(0), None)).unwrap();
        store.commit(batch).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let _guard = store.lock(&["counter"]).await;
                let mut entity = store.get_entity("counter").await.unwrap().unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
                entity.payload = json!(entity.payload.as_i64().unwrap() + 1);
                let mut batch = WriteBatch::new();
                batch.put_entity(&entity).unwrap();
                store.commit(batch).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entity = store.get_entity("counter").await.unwrap().unwrap();
        assert_eq!(entity.payload, json!(20));
    }

    #[tokio::test]
    async fn test_lock_sorts_and_dedups_keys() {
        let locks = KeyLocks::default();
        let guard = locks.lock(&["b", "a", "b"]).await;
        assert_eq!(locks.len(), 2);
        drop(guard);
        assert!(locks.is_empty());

        // Reacquire in the opposite order without deadlocking
        let _guard = locks.lock(&["a", "b"]).await;
    }

    #[tokio::test]
    async fn test_lock_table_does_not_grow_with_one_off_keys() {
        let store = local_store();
        for i in 0..1_000 {
            let id = format!("missing-{i}");
            let found = store.transaction(&[id.as_str()], |txn| Ok(txn.entity(&id).is_some())).await.unwrap();
            assert!(!found);
        }
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn test_lock_entry_kept_while_a_waiter_is_queued() {
        let locks = Arc::new(KeyLocks::default());
        let first = locks.lock(&["k"]).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _second = locks.lock(&["k"]).await;
            })
        };
        // Let the waiter clone the entry and park on it
        while Arc::strong_count(&locks.locks.get("k").unwrap()) < 3 {
            tokio::task::yield_now().await;
        }

        drop(first);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
