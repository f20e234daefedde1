//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::{ConflictPolicy, SyncEngineConfig};
//!
//! // Minimal config (uses defaults)
//! let config = SyncEngineConfig::default();
//! assert_eq!(config.network_timeout_ms, 5_000);
//! assert_eq!(config.conflict_policy, ConflictPolicy::ServerWins);
//!
//! // From JSON, e.g. a host settings file
//! let config: SyncEngineConfig = serde_json::from_str(r#"{
//!     "routes": [
//!         {"predicate": {"type": "resource-class", "class": "avatars"}, "strategy": "cache-first"},
//!         {"predicate": {"type": "key-prefix", "prefix": "feed/"}, "strategy": "stale-while-revalidate", "timeout_ms": 800}
//!     ],
//!     "class_policies": {"notes": "merge"},
//!     "coalescing": false
//! }"#).unwrap();
//! assert_eq!(config.routes.len(), 2);
//! assert!(!config.coalescing);
//! ```

use std::collections::HashMap;

use serde::Deserialize;

use crate::conflict::ConflictPolicy;
use crate::router::RouteRule;

/// Configuration for the sync engine.
///
/// All fields have defaults. Routing, policies and coalescing can change at
/// runtime through the engine's config watch channel; the rest are read at
/// build time.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEngineConfig {
    /// Ordered routing rules, first match wins
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Timeout for a network fetch when a rule sets none (default: 5s)
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,

    /// Policy for classes without an override
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Per resource class policy overrides
    #[serde(default)]
    pub class_policies: HashMap<String, ConflictPolicy>,

    /// Collapse queued mutations per entity
    #[serde(default = "default_true")]
    pub coalescing: bool,

    /// Resolve manual conflicts server-wins after this long (None = wait forever)
    #[serde(default)]
    pub manual_conflict_timeout_ms: Option<u64>,

    /// Start a drain after each local write while online
    #[serde(default = "default_true")]
    pub sync_on_write: bool,

    /// Periodic drain interval (0 = disabled)
    #[serde(default)]
    pub sync_interval_ms: u64,

    /// Attempts per remote call during replay
    #[serde(default = "default_replay_retries")]
    pub replay_retries: usize,

    /// Initial backoff between replay attempts
    #[serde(default = "default_replay_backoff_ms")]
    pub replay_backoff_ms: u64,

    /// SQLite file for the local store (None = caller supplies a store)
    #[serde(default)]
    pub store_path: Option<String>,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_network_timeout_ms() -> u64 { 5_000 }
fn default_true() -> bool { true }
fn default_replay_retries() -> usize { 3 }
fn default_replay_backoff_ms() -> u64 { 100 }
fn default_event_buffer() -> usize { 256 }

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            network_timeout_ms: default_network_timeout_ms(),
            conflict_policy: ConflictPolicy::default(),
            class_policies: HashMap::new(),
            coalescing: default_true(),
            manual_conflict_timeout_ms: None,
            sync_on_write: default_true(),
            sync_interval_ms: 0,
            replay_retries: default_replay_retries(),
            replay_backoff_ms: default_replay_backoff_ms(),
            store_path: None,
            event_buffer: default_event_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RoutePredicate, Strategy};

    #[test]
    fn test_defaults() {
        let config = SyncEngineConfig::default();
        assert!(config.routes.is_empty());
        assert!(config.coalescing);
        assert!(config.sync_on_write);
        assert_eq!(config.manual_conflict_timeout_ms, None);
        assert_eq!(config.replay_retries, 3);
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_empty_json_matches_default() {
        let config: SyncEngineConfig = serde_json::from_str("{}").unwrap();
        let default = SyncEngineConfig::default();
        assert_eq!(config.network_timeout_ms, default.network_timeout_ms);
        assert_eq!(config.coalescing, default.coalescing);
        assert_eq!(config.sync_on_write, default.sync_on_write);
        assert_eq!(config.replay_backoff_ms, default.replay_backoff_ms);
    }

    #[test]
    fn test_full_json() {
        let config: SyncEngineConfig = serde_json::from_value(serde_json::json!({
            "routes": [
                {"predicate": {"type": "kind", "kind": "read"}, "strategy": "cache-only"}
            ],
            "conflict_policy": "client-wins",
            "class_policies": {"notes": "manual"},
            "manual_conflict_timeout_ms": 60000,
            "sync_interval_ms": 30000,
            "store_path": "/tmp/offline.db"
        }))
        .unwrap();

        assert_eq!(config.routes[0].strategy, Strategy::CacheOnly);
        assert!(matches!(config.routes[0].predicate, RoutePredicate::Kind { .. }));
        assert_eq!(config.conflict_policy, ConflictPolicy::ClientWins);
        assert_eq!(config.class_policies["notes"], ConflictPolicy::Manual);
        assert_eq!(config.manual_conflict_timeout_ms, Some(60_000));
        assert_eq!(config.store_path.as_deref(), Some("/tmp/offline.db"));
    }
}
