//! Chaos Testing for the Offline Sync Engine
//!
//! Failure scenarios injected through wrappers:
//! 1. **FailingStore** - durable store errors at precise points
//! 2. **DroppingRemote** - connectivity lost in the middle of a drain
//! 3. **FlappingRemote** - connectivity lost and restored during a drain
//! 4. **Slow remote** - replay calls outliving the network timeout
//! 5. **Data corruption** - garbage bytes in the persisted queue

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use offline_sync::{
    ConnectivityState, DrainReport, DurableStore, EngineState, ErrorKind, InMemoryRemote, InMemoryStore, Precondition,
    RemoteApi, RemoteError, Snapshot, StopReason, StorageError, SyncEngine, SyncEngineConfig, SyncEvent, SyncState,
    WriteOp,
};

fn config() -> SyncEngineConfig {
    SyncEngineConfig {
        sync_on_write: false,
        replay_retries: 1,
        replay_backoff_ms: 1,
        ..SyncEngineConfig::default()
    }
}

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a store and fails commits (or scans) while switched on.
pub struct FailingStore {
    inner: InMemoryStore,
    fail_apply: AtomicBool,
    fail_scan: AtomicBool,
    apply_calls: AtomicU64,
}

impl FailingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_apply: AtomicBool::new(false),
            fail_scan: AtomicBool::new(false),
            apply_calls: AtomicU64::new(0),
        }
    }

    fn fail_commits(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    fn fail_scans(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected scan failure".into()));
        }
        self.inner.scan(prefix).await
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected disk full".into()));
        }
        self.inner.apply(ops).await
    }
}

async fn engine_on(store: Arc<FailingStore>, remote: Arc<InMemoryRemote>) -> Arc<SyncEngine> {
    SyncEngine::builder(config())
        .store(store)
        .remote(remote)
        .open()
        .await
        .expect("engine opens")
}

#[tokio::test]
async fn test_failed_commit_leaves_no_partial_write() {
    let store = Arc::new(FailingStore::new());
    let engine = engine_on(store.clone(), Arc::new(InMemoryRemote::new())).await;

    store.fail_commits(true);
    let err = engine.write("k", json!(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    store.fail_commits(false);

    // Neither the entity nor its queue item were persisted
    assert!(engine.get("k").await.unwrap().is_none());
    assert_eq!(engine.queue_size().await, 0);
    assert!(store.inner.scan("queue/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_write_back_failure_keeps_item_and_recovers() {
    let store = Arc::new(FailingStore::new());
    let remote = Arc::new(InMemoryRemote::new());
    let engine = engine_on(store.clone(), remote.clone()).await;

    engine.write("k", json!("v")).await.unwrap();

    // Remote accepts, local confirmation cannot be written
    store.fail_commits(true);
    let report = engine.set_connectivity(ConnectivityState::Online).await.unwrap().unwrap();
    assert!(matches!(report.stopped, Some(StopReason::Transient(_))));
    assert_eq!(engine.queue_size().await, 1);
    assert_eq!(remote.snapshot("k").unwrap().version, 1);

    store.fail_commits(false);
    let report = engine.force_sync().await.unwrap();
    assert_eq!(report.already_synced, 1);

    let entity = engine.get("k").await.unwrap().unwrap();
    assert!(entity.is_synced());
    assert_eq!(entity.version, 1);
    assert_eq!(remote.snapshot("k").unwrap().version, 1);
}

#[tokio::test]
async fn test_open_surfaces_storage_failure() {
    let store = Arc::new(FailingStore::new());
    store.fail_scans(true);

    let result = SyncEngine::builder(config())
        .store(store.clone())
        .remote(Arc::new(InMemoryRemote::new()))
        .open()
        .await;
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Storage));
}

#[tokio::test]
async fn test_garbage_queue_record_is_corruption() {
    let store = Arc::new(FailingStore::new());
    store
        .inner
        .put("queue/00000000000000000001", b"\x00\xffnot json".to_vec())
        .await
        .unwrap();

    let result = SyncEngine::builder(config())
        .store(store.clone())
        .remote(Arc::new(InMemoryRemote::new()))
        .open()
        .await;
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::QueueCorrupt));
}

// =============================================================================
// Dropping Remote - connectivity lost mid-drain
// =============================================================================

/// Takes the engine offline when the `nth` write arrives, then fails it.
struct DroppingRemote {
    inner: InMemoryRemote,
    nth: u64,
    writes: AtomicU64,
    engine: OnceLock<Weak<SyncEngine>>,
}

#[async_trait]
impl RemoteApi for DroppingRemote {
    async fn fetch(&self, id: &str) -> Result<Option<Snapshot>, RemoteError> {
        self.inner.fetch(id).await
    }

    async fn put(&self, id: &str, payload: &Value, precondition: Precondition) -> Result<Snapshot, RemoteError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                engine.set_connectivity(ConnectivityState::Offline).await.unwrap();
            }
            return Err(RemoteError::Unavailable("link down".into()));
        }
        self.inner.put(id, payload, precondition).await
    }

    async fn delete(&self, id: &str, precondition: Precondition) -> Result<Snapshot, RemoteError> {
        self.inner.delete(id, precondition).await
    }
}

#[tokio::test]
async fn test_connectivity_loss_pauses_drain() {
    let remote = Arc::new(DroppingRemote {
        inner: InMemoryRemote::new(),
        nth: 2,
        writes: AtomicU64::new(0),
        engine: OnceLock::new(),
    });
    let engine = SyncEngine::builder(config())
        .store(Arc::new(InMemoryStore::new()))
        .remote(remote.clone())
        .open()
        .await
        .unwrap();
    let _ = remote.engine.set(Arc::downgrade(&engine));

    for id in ["a", "b", "c"] {
        engine.write(id, json!(id)).await.unwrap();
    }

    let report = engine.set_connectivity(ConnectivityState::Online).await.unwrap().unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.stopped, Some(StopReason::Paused));
    assert_eq!(report.remaining, 2);
    assert_eq!(engine.state(), EngineState::Offline);

    // Nothing was lost; the next reconnect finishes the job
    assert_eq!(engine.get("b").await.unwrap().unwrap().sync_state, SyncState::Pending);
    let report = engine.set_connectivity(ConnectivityState::Online).await.unwrap().unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(remote.inner.snapshot("c").unwrap().payload, json!("c"));
}

/// Reconnects the engine the moment a drain reports that it stopped.
///
/// Runs inside the stopping drain, so the reconnect always finds the drain
/// lock held.
struct ReconnectWhenDrainStops {
    engine: Arc<OnceLock<Weak<SyncEngine>>>,
    fired: AtomicBool,
    reconnect_report: Arc<Mutex<Option<Option<DrainReport>>>>,
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for ReconnectWhenDrainStops {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageVisitor(String::new());
        event.record(&mut message);
        if !message.0.starts_with("Drain stopped") || self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(engine) = self.engine.get().and_then(Weak::upgrade) else { return };
        // Out of the runtime's cooperative budget: this polls inside a task
        let reconnect = tokio::task::unconstrained(engine.set_connectivity(ConnectivityState::Online));
        let report = futures::executor::block_on(reconnect).expect("reconnect succeeds");
        *self.reconnect_report.lock().unwrap() = Some(report);
    }
}

#[tokio::test]
async fn test_reconnect_while_drain_pauses_resumes_replay() {
    let slot = Arc::new(OnceLock::new());
    let reconnect_report = Arc::new(Mutex::new(None));
    let layer = ReconnectWhenDrainStops {
        engine: slot.clone(),
        fired: AtomicBool::new(false),
        reconnect_report: reconnect_report.clone(),
    };
    let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

    let remote = Arc::new(DroppingRemote {
        inner: InMemoryRemote::new(),
        nth: 1,
        writes: AtomicU64::new(0),
        engine: OnceLock::new(),
    });
    let engine = SyncEngine::builder(config())
        .store(Arc::new(InMemoryStore::new()))
        .remote(remote.clone())
        .open()
        .await
        .unwrap();
    let _ = remote.engine.set(Arc::downgrade(&engine));
    let _ = slot.set(Arc::downgrade(&engine));

    engine.write("a", json!("a")).await.unwrap();
    engine.write("b", json!("b")).await.unwrap();

    let report = engine.set_connectivity(ConnectivityState::Online).await.unwrap().unwrap();

    // The reconnect found the drain running and was folded into it
    let skipped = reconnect_report.lock().unwrap().clone().flatten();
    assert!(skipped.is_some_and(|r| r.skipped));

    assert!(report.is_complete());
    assert_eq!(report.applied, 2);
    assert_eq!(engine.queue_size().await, 0);
    assert_eq!(engine.connectivity(), ConnectivityState::Online);
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(remote.inner.snapshot("b").unwrap().payload, json!("b"));
}

/// Drops and restores connectivity while the `nth` write is in flight, then
/// lets the write through.
struct FlappingRemote {
    inner: InMemoryRemote,
    nth: u64,
    writes: AtomicU64,
    engine: OnceLock<Weak<SyncEngine>>,
}

#[async_trait]
impl RemoteApi for FlappingRemote {
    async fn fetch(&self, id: &str) -> Result<Option<Snapshot>, RemoteError> {
        self.inner.fetch(id).await
    }

    async fn put(&self, id: &str, payload: &Value, precondition: Precondition) -> Result<Snapshot, RemoteError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                engine.set_connectivity(ConnectivityState::Offline).await.unwrap();
                let reconnect = engine.set_connectivity(ConnectivityState::Online).await.unwrap();
                assert!(reconnect.is_some_and(|r| r.skipped));
            }
        }
        self.inner.put(id, payload, precondition).await
    }

    async fn delete(&self, id: &str, precondition: Precondition) -> Result<Snapshot, RemoteError> {
        self.inner.delete(id, precondition).await
    }
}

#[tokio::test]
async fn test_reconnect_during_complete_drain_runs_again() {
    let remote = Arc::new(FlappingRemote {
        inner: InMemoryRemote::new(),
        nth: 1,
        writes: AtomicU64::new(0),
        engine: OnceLock::new(),
    });
    let engine = SyncEngine::builder(config())
        .store(Arc::new(InMemoryStore::new()))
        .remote(remote.clone())
        .open()
        .await
        .unwrap();
    let _ = remote.engine.set(Arc::downgrade(&engine));
    let mut events = engine.subscribe();

    engine.write("a", json!(1)).await.unwrap();
    engine.set_connectivity(ConnectivityState::Online).await.unwrap().unwrap();

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SyncCompleted(report) = event {
            completed.push(report);
        }
    }
    // First round replays the item, the second answers the reconnect
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].applied, 1);
    assert!(completed[0].is_complete());
    assert_eq!(completed[1].attempted, 0);

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(remote.inner.put_calls(), 1);
    assert!(engine.get("a").await.unwrap().unwrap().is_synced());
}

// =============================================================================
// Slow remote - bounded replay calls
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_replay_call_times_out_and_stays_queued() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_latency(Some(Duration::from_secs(30)));
    let engine = SyncEngine::builder(SyncEngineConfig { network_timeout_ms: 100, ..config() })
        .store(Arc::new(InMemoryStore::new()))
        .remote(remote.clone())
        .open()
        .await
        .unwrap();

    engine.write("slow", json!(1)).await.unwrap();
    let report = engine.set_connectivity(ConnectivityState::Online).await.unwrap().unwrap();

    assert!(matches!(report.stopped, Some(StopReason::Transient(_))));
    assert_eq!(engine.queue_size().await, 1);
    // The abandoned call never reached the server state
    assert!(remote.snapshot("slow").is_none());

    remote.set_latency(None);
    let report = engine.force_sync().await.unwrap();
    assert_eq!(report.applied, 1);
}
