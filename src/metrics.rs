// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `strategy`: cache-first, network-first, stale-while-revalidate, ...
//! - `source`: cache, network, local
//! - `operation`: fetch, put, delete
//! - `outcome`: applied, already-synced, conflict, rejected, retry, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// ROUTER
// ═══════════════════════════════════════════════════════════════════════════

/// Record a routed request and where its answer came from
pub fn record_route(strategy: &str, source: &str) {
    counter!(
        "offline_sync_requests_total",
        "strategy" => strategy.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a routed request that produced an error
pub fn record_route_error(strategy: &str, kind: &str) {
    counter!(
        "offline_sync_request_errors_total",
        "strategy" => strategy.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a stale answer served from cache after a network failure
pub fn record_stale_serve(strategy: &str) {
    counter!(
        "offline_sync_stale_responses_total",
        "strategy" => strategy.to_string()
    )
    .increment(1);
}

/// Record a background revalidation result
pub fn record_revalidation(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "offline_sync_revalidations_total",
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a remote call latency
pub fn record_remote_latency(operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_remote_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a remote call that timed out
pub fn record_timeout(operation: &str) {
    counter!(
        "offline_sync_remote_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Set current queue depth
pub fn set_queue_depth(count: usize) {
    gauge!("offline_sync_queue_items").set(count as f64);
}

/// Record a mutation entering the queue
pub fn record_enqueue(coalesced: bool) {
    let mode = if coalesced { "coalesced" } else { "appended" };
    counter!(
        "offline_sync_enqueued_total",
        "mode" => mode
    )
    .increment(1);
}

/// Record the outcome of replaying one queue item
pub fn record_replay(outcome: &str) {
    counter!(
        "offline_sync_replays_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a finished drain
pub fn record_drain(attempted: usize, remaining: usize, duration: Duration) {
    counter!("offline_sync_drains_total").increment(1);
    histogram!("offline_sync_drain_items").record(attempted as f64);
    histogram!("offline_sync_drain_seconds").record(duration.as_secs_f64());
    set_queue_depth(remaining);
}

/// Record queue data corruption detected on load
pub fn record_corruption(key: &str) {
    counter!(
        "offline_sync_corruption_detected_total",
        "key" => key.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFLICTS & ENGINE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a detected conflict and the policy applied to it
pub fn record_conflict(policy: &str) {
    counter!(
        "offline_sync_conflicts_total",
        "policy" => policy.to_string()
    )
    .increment(1);
}

/// Set number of conflicts waiting for a manual choice
pub fn set_pending_conflicts(count: usize) {
    gauge!("offline_sync_pending_conflicts").set(count as f64);
}

/// Record engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set connectivity (1 = online, 0 = offline)
pub fn set_online(online: bool) {
    gauge!("offline_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// A timing guard that records remote latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_remote_latency(self.operation, self.start.elapsed());
    }
}
