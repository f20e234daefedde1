// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties together the components:
//! - [`LocalStore`] over a durable backend (single source of truth)
//! - [`SyncQueue`] of pending mutations
//! - [`ConflictResolver`] for version disagreements
//! - a [`RemoteApi`] implementation
//!
//! # Lifecycle
//!
//! ```text
//! Offline ──(online)──► Draining ──► Idle
//!    ▲                     │          │
//!    └─────(offline)───────┴──────────┘
//! ```
//!
//! Every trigger (reconnect, local write, periodic tick, [`force_sync`])
//! funnels into the same drain path, and at most one drain runs per engine.
//!
//! [`force_sync`]: SyncEngine::force_sync
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{ConnectivityState, InMemoryRemote, InMemoryStore, SyncEngine, SyncEngineConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> offline_sync::SyncResult<()> {
//! let engine = SyncEngine::builder(SyncEngineConfig::default())
//!     .store(Arc::new(InMemoryStore::new()))
//!     .remote(Arc::new(InMemoryRemote::new()))
//!     .open()
//!     .await?;
//!
//! engine.write("note.1", json!({"title": "draft"})).await?;
//! engine.set_connectivity(ConnectivityState::Online).await?;
//! assert_eq!(engine.queue_size().await, 0);
//! # Ok(())
//! # }
//! ```

mod types;
mod api;
mod lifecycle;
mod replay;

pub use types::{ConnectivityState, EngineState, SyncEvent};

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SyncEngineConfig;
use crate::conflict::{ConflictResolver, MergeStrategy};
use crate::error::{SyncError, SyncResult};
use crate::queue::SyncQueue;
use crate::remote::RemoteApi;
use crate::resilience::retry::RetryConfig;
use crate::storage::local::LocalStore;
use crate::storage::memory::InMemoryStore;
use crate::storage::sqlite::SqliteStore;
use crate::storage::traits::DurableStore;

/// Offline-first sync engine.
///
/// Built with [`SyncEngine::builder`] and shared as `Arc<SyncEngine>`.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. Operations on different entities run
/// concurrently; operations on the same entity are serialized through the
/// store's per-key locks.
pub struct SyncEngine {
    /// Configuration (can be updated at runtime via watch channel)
    pub(super) config: RwLock<SyncEngineConfig>,

    /// Durable state: entities, queue records, parked conflicts
    pub(super) store: Arc<LocalStore>,

    pub(super) queue: SyncQueue,

    pub(super) remote: Arc<dyn RemoteApi>,

    pub(super) resolver: RwLock<ConflictResolver>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Connectivity owned by this engine instance
    pub(super) connectivity: watch::Sender<ConnectivityState>,
    pub(super) connectivity_rx: watch::Receiver<ConnectivityState>,

    pub(super) events: broadcast::Sender<SyncEvent>,

    /// Held for the duration of a drain
    pub(super) drain_lock: tokio::sync::Mutex<()>,

    /// Set when a trigger arrives while a drain runs, so it goes round again
    pub(super) rerun: AtomicBool,

    /// Background tasks (connectivity watcher, periodic sync, config updates)
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Handle for spawning work that outlives the calling future
    pub(super) weak_self: Weak<SyncEngine>,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncEngineConfig,
    store: Option<Arc<dyn DurableStore>>,
    remote: Option<Arc<dyn RemoteApi>>,
    merger: Option<Arc<dyn MergeStrategy>>,
    config_rx: Option<watch::Receiver<SyncEngineConfig>>,
}

impl SyncEngineBuilder {
    /// Durable backend. Without one, `config.store_path` opens SQLite, and
    /// failing that an in-memory store is used.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Merge used by the `merge` policy (default: field-level merge).
    #[must_use]
    pub fn merge_strategy(mut self, merger: Arc<dyn MergeStrategy>) -> Self {
        self.merger = Some(merger);
        self
    }

    /// Runtime config updates.
    #[must_use]
    pub fn config_updates(mut self, config_rx: watch::Receiver<SyncEngineConfig>) -> Self {
        self.config_rx = Some(config_rx);
        self
    }

    /// Open the store, load and verify the queue, and build the engine.
    ///
    /// The engine starts [`Offline`](EngineState::Offline).
    ///
    /// # Errors
    ///
    /// - [`SyncError::Config`] if no remote was given
    /// - [`SyncError::QueueCorrupt`] if a persisted queue record fails its check
    /// - [`SyncError::Storage`] if the store cannot be opened
    #[tracing::instrument(skip_all)]
    pub async fn open(self) -> SyncResult<Arc<SyncEngine>> {
        let remote = self
            .remote
            .ok_or_else(|| SyncError::Config("no remote API configured".to_string()))?;

        let backend: Arc<dyn DurableStore> = match (self.store, &self.config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteStore::open(path).await?),
            (None, None) => {
                warn!("No durable store configured, using in-memory store (state is lost on exit)");
                Arc::new(InMemoryStore::new())
            }
        };

        let store = Arc::new(LocalStore::new(backend));
        let queue = SyncQueue::open(store.clone(), self.config.coalescing).await?;

        let mut resolver = ConflictResolver::new(self.config.conflict_policy, self.config.class_policies.clone());
        if let Some(merger) = self.merger {
            resolver = resolver.with_merger(merger);
        }

        let (state_tx, state_rx) = watch::channel(EngineState::Offline);
        let (connectivity_tx, connectivity_rx) = watch::channel(ConnectivityState::Offline);
        let (events, _) = broadcast::channel(self.config.event_buffer.max(1));

        let pending = queue.size().await;
        let engine = Arc::new_cyclic(|weak_self| SyncEngine {
            config: RwLock::new(self.config),
            store,
            queue,
            remote,
            resolver: RwLock::new(resolver),
            state: state_tx,
            state_rx,
            connectivity: connectivity_tx,
            connectivity_rx,
            events,
            drain_lock: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        });

        if let Some(config_rx) = self.config_rx {
            engine.watch_config(config_rx);
        }

        crate::metrics::set_online(false);
        crate::metrics::set_engine_state("offline");
        info!(pending, "Sync engine opened");
        Ok(engine)
    }
}

impl SyncEngine {
    pub fn builder(config: SyncEngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            store: None,
            remote: None,
            merger: None,
            config_rx: None,
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch engine state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn connectivity(&self) -> ConnectivityState {
        *self.connectivity_rx.borrow()
    }

    #[must_use]
    pub fn connectivity_receiver(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity_rx.clone()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connectivity().is_online()
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> SyncEngineConfig {
        self.config.read().clone()
    }

    /// Apply a new configuration.
    ///
    /// Routing, conflict policies, coalescing and replay settings take effect
    /// on the next request or drain.
    pub fn update_config(&self, config: SyncEngineConfig) {
        self.queue.set_coalescing(config.coalescing);
        self.resolver
            .write()
            .set_policies(config.conflict_policy, config.class_policies.clone());
        info!(
            routes = config.routes.len(),
            coalescing = config.coalescing,
            policy = %config.conflict_policy,
            "Config updated"
        );
        *self.config.write() = config;
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    pub(super) fn set_state(&self, state: EngineState) {
        if self.state.send_replace(state) != state {
            crate::metrics::set_engine_state(&state.to_string().to_lowercase());
        }
    }

    pub(super) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(super) fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read().network_timeout_ms)
    }

    pub(super) fn replay_retry(&self) -> RetryConfig {
        let config = self.config.read();
        RetryConfig::replay(config.replay_retries, config.replay_backoff_ms)
    }

    /// Start a drain on its own task, detached from the caller.
    pub(super) fn spawn_drain(&self, trigger: &'static str) {
        let Some(engine) = self.weak_self.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = engine.trigger_drain(trigger).await {
                warn!(trigger, error = %e, "Background drain failed");
            }
        });
    }

    fn watch_config(&self, mut config_rx: watch::Receiver<SyncEngineConfig>) {
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                let Some(engine) = weak.upgrade() else { break };
                let config = config_rx.borrow_and_update().clone();
                engine.update_config(config);
            }
        });
        self.tasks.lock().push(handle);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
