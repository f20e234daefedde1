// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Opening an engine on a SQLite file with an in-memory remote
//! 2. Writing while offline (optimistic, queued, coalesced)
//! 3. Reconnecting and draining the queue
//! 4. A server-wins conflict and a manual one
//! 5. Routed reads (cache-first, stale-while-revalidate)
//! 6. Displaying metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use offline_sync::{
    CacheRouter, ConflictPolicy, ConnectivityState, InMemoryRemote, ManualChoice, Request, RoutePredicate, RouteRule,
    Strategy, SyncEngine, SyncEngineConfig, SyncEvent,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "offline_sync=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and open the engine
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let config = SyncEngineConfig {
        store_path: Some(dir.path().join("offline.db").to_string_lossy().into_owned()),
        routes: vec![
            RouteRule {
                predicate: RoutePredicate::KeyPrefix { prefix: "feed/".into() },
                strategy: Strategy::StaleWhileRevalidate,
                timeout_ms: Some(500),
            },
            RouteRule {
                predicate: RoutePredicate::ResourceClass { class: "profiles".into() },
                strategy: Strategy::CacheFirst,
                timeout_ms: None,
            },
        ],
        class_policies: HashMap::from([("notes".to_string(), ConflictPolicy::Manual)]),
        sync_on_write: false,
        ..Default::default()
    };

    let remote = Arc::new(InMemoryRemote::new());
    let engine = SyncEngine::builder(config).remote(remote.clone()).open().await?;
    let router = CacheRouter::new(engine.clone());

    let mut events = engine.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::ConflictDetected(record) => {
                    println!("   ⚡ conflict on {} ({:?})", record.entity_id, record.state)
                }
                SyncEvent::SyncCompleted(report) => println!(
                    "   ✔ drain: {} applied, {} conflicts, {} left",
                    report.applied, report.conflicts, report.remaining
                ),
                _ => {}
            }
        }
    });

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 Writing while offline...");
    for i in 0..3 {
        router.handle(Request::write("todo.1", json!({"title": "buy milk", "rev": i}))).await?;
    }
    router.handle(Request::write("todo.2", json!({"title": "walk dog"}))).await?;
    println!("   └─ queued mutations: {} (three writes to todo.1 coalesced)", engine.queue_size().await);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Reconnect
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Going online...");
    engine.set_connectivity(ConnectivityState::Online).await?;
    println!("   └─ remote todo.1 = {:?}", remote.snapshot("todo.1").map(|s| s.payload));

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Conflicts
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚔️  Concurrent edits...");
    engine.set_connectivity(ConnectivityState::Offline).await?;
    engine.write("todo.2", json!({"title": "walk the dog"})).await?;
    engine
        .write_with_class("note.1", json!({"body": "mine"}), Some("notes"))
        .await?;
    remote.seed("todo.2", json!({"title": "walk dog at 6"}));
    remote.seed("note.1", json!({"body": "theirs"}));
    remote.seed("note.1", json!({"body": "theirs, edited"}));

    engine.set_connectivity(ConnectivityState::Online).await?;
    println!("   ├─ todo.2 (server-wins) = {:?}", engine.get("todo.2").await?.map(|e| e.payload));
    println!("   ├─ note.1 pending manual: {}", engine.resolved_entity("note.1").await.is_err());
    engine
        .resolve_conflict("note.1", ManualChoice::Merge(json!({"body": "mine + theirs"})))
        .await?;
    engine.force_sync().await?;
    println!("   └─ note.1 resolved = {:?}", engine.resolved_entity("note.1").await?.payload);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Routed reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading...");
    remote.seed("feed/today", json!(["headline 1"]));
    let first = router.handle(Request::read("feed/today")).await?;
    remote.seed("feed/today", json!(["headline 1", "headline 2"]));
    let cached = router.handle(Request::read("feed/today")).await?;
    router.settle().await;
    let refreshed = router.handle(Request::read("feed/today")).await?;
    println!("   ├─ feed: {:?} → {:?} → {:?}", first.payload(), cached.payload(), refreshed.payload());

    remote.seed("user.7", json!({"name": "Ada"}));
    let profile = router.handle(Request::read("user.7").with_class("profiles")).await?;
    println!("   └─ profile via {:?}: {:?}", profile.source, profile.payload());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Engine Metrics:");
    dump_metrics(&snapshotter);

    engine.shutdown().await;
    event_log.abort();
    println!("\n✅ Done");
    Ok(())
}

/// Dump captured counters and gauges, plus histogram sample counts.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let labels = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), labels, value)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   │  └─ {line}");
    }
}
