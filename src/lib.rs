//! # Offline Sync
//!
//! An offline-first data synchronization engine: reads are served from a
//! local store through pluggable cache strategies, writes are persisted
//! locally first and queued, and the queue is replayed against the remote
//! when connectivity returns, with version conflicts settled by policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CacheRouter                          │
//! │  • Ordered (predicate, strategy) rules, first match wins   │
//! │  • cache-first / network-first / stale-while-revalidate    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SyncEngine                           │
//! │  • Optimistic writes: entity + queue item, one commit      │
//! │  • Connectivity: Offline → Draining → Idle                 │
//! │  • One drain at a time, every trigger shares the path      │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                     │
//!            ▼                                     ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │        SyncQueue         │      │     ConflictResolver     │
//! │  • Checksummed records   │      │  • server/client-wins    │
//! │  • Per-entity coalescing │      │  • merge (pluggable)     │
//! │  • Ordered replay        │      │  • manual (persisted)    │
//! └──────────────────────────┘      └──────────────────────────┘
//!            │
//!            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              DurableStore (SQLite / in-memory)              │
//! │  • Single source of truth, atomic multi-key commits        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{CacheRouter, ConnectivityState, InMemoryRemote, Request, SyncEngine, SyncEngineConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> offline_sync::SyncResult<()> {
//!     let config = SyncEngineConfig {
//!         store_path: Some("./offline.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let engine = SyncEngine::builder(config)
//!         .remote(Arc::new(InMemoryRemote::new()))
//!         .open()
//!         .await?;
//!     let router = CacheRouter::new(engine.clone());
//!
//!     // Accepted locally while offline
//!     router.handle(Request::write("note.1", json!({"title": "draft"}))).await?;
//!
//!     // Reconnect: the queue is replayed
//!     let report = engine.set_connectivity(ConnectivityState::Online).await?;
//!     println!("{report:?}");
//!
//!     let note = router.handle(Request::read("note.1")).await?;
//!     println!("{:?}", note.payload());
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncEngine`] orchestrating everything below
//! - [`router`]: [`CacheRouter`] and routing rules
//! - [`queue`]: the durable [`SyncQueue`](queue::SyncQueue)
//! - [`conflict`]: policies, merge strategies and conflict records
//! - [`storage`]: [`DurableStore`] backends and the transactional adapter
//! - [`remote`]: the [`RemoteApi`] boundary and an in-memory remote
//! - [`resilience`]: retry with backoff, drain coordination

pub mod config;
pub mod entity;
pub mod error;
pub mod storage;
pub mod remote;
pub mod queue;
pub mod conflict;
pub mod router;
pub mod resilience;
pub mod coordinator;
pub mod metrics;

pub use config::SyncEngineConfig;
pub use coordinator::{ConnectivityState, EngineState, SyncEngine, SyncEngineBuilder, SyncEvent};
pub use entity::{Entity, Snapshot, SyncState};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use storage::traits::{DurableStore, StorageError, WriteOp};
pub use storage::memory::InMemoryStore;
pub use storage::sqlite::SqliteStore;
pub use remote::{Precondition, RemoteApi, RemoteError};
pub use remote::memory::InMemoryRemote;
pub use queue::{DrainReport, Operation, QueueItem, StopReason};
pub use conflict::{ConflictPolicy, ConflictRecord, FieldMerge, ManualChoice, MergeStrategy, Resolution};
pub use router::{CacheRouter, Request, RequestKind, Response, RouteRule, RoutePredicate, Source, Strategy};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
