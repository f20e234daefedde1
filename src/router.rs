//! Request routing over the local store and the remote.
//!
//! A [`CacheRouter`] matches each [`Request`] against the configured
//! [`RouteRule`]s (first match wins) and runs the selected [`Strategy`]:
//!
//! | strategy                 | store                       | network                         |
//! |--------------------------|-----------------------------|---------------------------------|
//! | `cache-first`            | served if present           | on miss, result stored          |
//! | `network-first`          | fallback, marked stale      | first, bounded by a timeout     |
//! | `stale-while-revalidate` | served immediately          | background refresh, deduped     |
//! | `network-only`           | untouched                   | always, failures surface        |
//! | `cache-only`             | only source                 | never                           |
//! | `queue-first` (writes)   | written first               | via the engine's queue          |
//!
//! Without a matching rule, reads are `network-first` and writes `queue-first`.
//! Network access is skipped entirely while the engine is offline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::coordinator::SyncEngine;
use crate::entity::Entity;
use crate::error::{SyncError, SyncResult};
use crate::metrics;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    CacheOnly,
    /// Optimistic local write, propagated through the sync queue
    QueueFirst,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::NetworkOnly => "network-only",
            Self::CacheOnly => "cache-only",
            Self::QueueFirst => "queue-first",
        }
    }

    /// Whether this strategy can serve requests of `kind`.
    pub fn applies_to(&self, kind: RequestKind) -> bool {
        match self {
            Self::QueueFirst => kind != RequestKind::Read,
            _ => kind == RequestKind::Read,
        }
    }

    fn default_for(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Read => Self::NetworkFirst,
            RequestKind::Write | RequestKind::Delete => Self::QueueFirst,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    Read,
    Write,
    Delete,
}

/// Condition a request must meet for a rule to apply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoutePredicate {
    Any,
    ResourceClass { class: String },
    KeyPrefix { prefix: String },
    Kind { kind: RequestKind },
    All { of: Vec<RoutePredicate> },
}

impl RoutePredicate {
    pub fn matches(&self, request: &Request) -> bool {
        match self {
            Self::Any => true,
            Self::ResourceClass { class } => request.resource_class.as_deref() == Some(class.as_str()),
            Self::KeyPrefix { prefix } => request.key.starts_with(prefix.as_str()),
            Self::Kind { kind } => request.kind == *kind,
            Self::All { of } => of.iter().all(|p| p.matches(request)),
        }
    }
}

/// One routing rule: `{predicate, strategy, timeout_ms}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    pub predicate: RoutePredicate,
    pub strategy: Strategy,
    /// Network timeout for this rule (falls back to `network_timeout_ms`)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RouteRule {
    fn applies(&self, request: &Request) -> bool {
        self.strategy.applies_to(request.kind) && self.predicate.matches(request)
    }
}

/// First rule that applies to `request`.
pub fn select_rule<'a>(rules: &'a [RouteRule], request: &Request) -> Option<&'a RouteRule> {
    rules.iter().find(|rule| rule.applies(request))
}

/// A read or write routed through a [`CacheRouter`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub key: String,
    pub kind: RequestKind,
    pub payload: Option<Value>,
    pub resource_class: Option<String>,
}

impl Request {
    pub fn read(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: RequestKind::Read,
            payload: None,
            resource_class: None,
        }
    }

    pub fn write(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            kind: RequestKind::Write,
            payload: Some(payload),
            resource_class: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: RequestKind::Delete,
            payload: None,
            resource_class: None,
        }
    }

    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.resource_class = Some(class.into());
        self
    }
}

/// Where a response's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Local store, no network involved
    Cache,
    /// Fresh from the remote
    Network,
    /// A local write accepted for syncing
    Local,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Network => "network",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub key: String,
    /// Visible entity (`None` after a delete)
    pub entity: Option<Entity>,
    pub source: Source,
    /// Served from the store when the remote could not confirm it
    pub stale: bool,
    pub strategy: Strategy,
}

impl Response {
    pub fn payload(&self) -> Option<&Value> {
        self.entity.as_ref().map(|e| &e.payload)
    }
}

/// Routes requests to strategies over a shared [`SyncEngine`].
pub struct CacheRouter {
    engine: Arc<SyncEngine>,
    /// Keys with a background revalidation running
    in_flight: Arc<DashMap<String, ()>>,
    revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheRouter {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            in_flight: Arc::new(DashMap::new()),
            revalidations: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Serve `request` with the strategy its first matching rule selects.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Unavailable`] when neither store nor network can answer
    /// - [`SyncError::NotFound`] when the key is absent (cache-only, or the
    ///   remote reports no such resource)
    #[instrument(skip(self, request), fields(key = %request.key, kind = ?request.kind))]
    pub async fn handle(&self, request: Request) -> SyncResult<Response> {
        let (strategy, timeout) = self.route(&request);
        debug!(%strategy, timeout_ms = timeout.as_millis() as u64, "Routing request");

        let result = match strategy {
            Strategy::CacheFirst => self.cache_first(&request, timeout).await,
            Strategy::NetworkFirst => self.network_first(&request, timeout).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(&request, timeout).await,
            Strategy::NetworkOnly => self.network_only(&request, timeout).await,
            Strategy::CacheOnly => self.cache_only(&request).await,
            Strategy::QueueFirst => self.queue_first(request).await,
        };

        match &result {
            Ok(response) => {
                metrics::record_route(strategy.as_str(), response.source.as_str());
                if response.stale {
                    metrics::record_stale_serve(strategy.as_str());
                }
            }
            Err(e) => metrics::record_route_error(strategy.as_str(), e.kind().as_str()),
        }
        result.map(|mut response| {
            response.strategy = strategy;
            response
        })
    }

    /// Wait for outstanding background revalidations.
    pub async fn settle(&self) {
        let handles: Vec<_> = self.revalidations.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Revalidation task failed");
            }
        }
    }

    /// Number of keys with a revalidation in flight.
    pub fn revalidations_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn route(&self, request: &Request) -> (Strategy, Duration) {
        let config = self.engine.config();
        let rule = select_rule(&config.routes, request);
        let strategy = rule.map_or_else(|| Strategy::default_for(request.kind), |rule| rule.strategy);
        let timeout_ms = rule.and_then(|rule| rule.timeout_ms).unwrap_or(config.network_timeout_ms);
        (strategy, Duration::from_millis(timeout_ms))
    }

    async fn cache_first(&self, request: &Request, timeout: Duration) -> SyncResult<Response> {
        if let Some(entity) = self.engine.get(&request.key).await? {
            return Ok(response(request, Some(entity), Source::Cache, false));
        }
        let entity = self.fetch_and_store(request, timeout).await?;
        Ok(response(request, Some(entity), Source::Network, false))
    }

    async fn network_first(&self, request: &Request, timeout: Duration) -> SyncResult<Response> {
        match self.fetch_and_store(request, timeout).await {
            Ok(entity) => Ok(response(request, Some(entity), Source::Network, false)),
            Err(SyncError::Unavailable { reason, .. }) => match self.engine.get(&request.key).await? {
                Some(entity) => {
                    debug!(key = %request.key, %reason, "Network failed, serving cached value");
                    Ok(response(request, Some(entity), Source::Cache, true))
                }
                None => Err(SyncError::unavailable(&request.key, reason)),
            },
            Err(e) => Err(e),
        }
    }

    async fn stale_while_revalidate(&self, request: &Request, timeout: Duration) -> SyncResult<Response> {
        match self.engine.get(&request.key).await? {
            Some(entity) => {
                self.spawn_revalidation(request, timeout);
                Ok(response(request, Some(entity), Source::Cache, false))
            }
            // Nothing cached: the caller waits for the fetch
            None => {
                let entity = self.fetch_and_store(request, timeout).await?;
                Ok(response(request, Some(entity), Source::Network, false))
            }
        }
    }

    async fn network_only(&self, request: &Request, timeout: Duration) -> SyncResult<Response> {
        let snapshot = self
            .engine
            .fetch_remote(&request.key, timeout)
            .await
            .map_err(|e| SyncError::unavailable(&request.key, e))?
            .ok_or_else(|| SyncError::not_found(&request.key))?;
        let entity = Entity::from_remote(&request.key, &snapshot, request.resource_class.clone());
        Ok(response(request, Some(entity), Source::Network, false))
    }

    async fn cache_only(&self, request: &Request) -> SyncResult<Response> {
        let entity = self
            .engine
            .get(&request.key)
            .await?
            .ok_or_else(|| SyncError::not_found(&request.key))?;
        Ok(response(request, Some(entity), Source::Cache, false))
    }

    async fn queue_first(&self, request: Request) -> SyncResult<Response> {
        match request.kind {
            RequestKind::Delete => {
                self.engine.delete(&request.key).await?;
                Ok(response(&request, None, Source::Local, false))
            }
            _ => {
                let Some(payload) = request.payload.clone() else {
                    return Err(SyncError::Config(format!("write to '{}' has no payload", request.key)));
                };
                let entity = self
                    .engine
                    .write_with_class(&request.key, payload, request.resource_class.as_deref())
                    .await?;
                Ok(response(&request, Some(entity), Source::Local, false))
            }
        }
    }

    /// Fetch and write back, returning what a read should see.
    async fn fetch_and_store(&self, request: &Request, timeout: Duration) -> SyncResult<Entity> {
        fetch_and_store(&self.engine, &request.key, request.resource_class.clone(), timeout).await
    }

    fn spawn_revalidation(&self, request: &Request, timeout: Duration) {
        if !self.engine.is_online() {
            return;
        }
        match self.in_flight.entry(request.key.clone()) {
            Entry::Occupied(_) => {
                debug!(key = %request.key, "Revalidation already in flight");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let engine = Arc::clone(&self.engine);
        let in_flight = Arc::clone(&self.in_flight);
        let key = request.key.clone();
        let class = request.resource_class.clone();
        let handle = tokio::spawn(async move {
            let result = fetch_and_store(&engine, &key, class, timeout).await;
            metrics::record_revalidation(result.is_ok());
            if let Err(e) = result {
                debug!(%key, error = %e, "Background revalidation failed");
            }
            in_flight.remove(&key);
        });

        let mut revalidations = self.revalidations.lock();
        revalidations.retain(|handle| !handle.is_finished());
        revalidations.push(handle);
    }
}

async fn fetch_and_store(
    engine: &SyncEngine,
    key: &str,
    class: Option<String>,
    timeout: Duration,
) -> SyncResult<Entity> {
    let fetched = engine
        .fetch_remote(key, timeout)
        .await
        .map_err(|e| SyncError::unavailable(key, e))?;
    engine
        .store_remote(key, class, fetched)
        .await?
        .ok_or_else(|| SyncError::not_found(key))
}

fn response(request: &Request, entity: Option<Entity>, source: Source, stale: bool) -> Response {
    Response {
        key: request.key.clone(),
        entity,
        source,
        stale,
        strategy: Strategy::default_for(request.kind),
    }
}
