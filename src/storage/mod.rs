//! Durable local persistence.
//!
//! - [`traits`]: the [`DurableStore`](traits::DurableStore) substrate contract
//! - [`memory`]: in-process backend
//! - [`sqlite`]: file-backed backend (survives restarts)
//! - [`local`]: typed, per-key transactional adapter used by the engine

pub mod traits;
pub mod memory;
pub mod sqlite;
pub mod local;
