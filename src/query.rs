//! Query envelope, the query dispatcher, and its TTL result cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::epoch_millis;
use crate::command::DispatchContext;
use crate::error::DispatchError;
use crate::middleware::QueryMiddleware;

/// Typed payload of a query, adjacently tagged like [`crate::command::CommandBody`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum QueryBody {
    GetCurrentState,
    GetEventHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<usize>,
    },
    GetStateAtVersion {
        version: u64,
    },
    GetAggregateSummary,
}

impl QueryBody {
    pub fn kind(&self) -> QueryKind {
        match self {
            QueryBody::GetCurrentState => QueryKind::CurrentState,
            QueryBody::GetEventHistory { .. } => QueryKind::EventHistory,
            QueryBody::GetStateAtVersion { .. } => QueryKind::StateAtVersion,
            QueryBody::GetAggregateSummary => QueryKind::AggregateSummary,
        }
    }
}

/// Registry key for query handlers and per-kind cache lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    CurrentState,
    EventHistory,
    StateAtVersion,
    AggregateSummary,
}

impl QueryKind {
    /// Every query kind, in declaration order.
    pub const ALL: [QueryKind; 4] = [
        QueryKind::CurrentState,
        QueryKind::EventHistory,
        QueryKind::StateAtVersion,
        QueryKind::AggregateSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::CurrentState => "GET_CURRENT_STATE",
            QueryKind::EventHistory => "GET_EVENT_HISTORY",
            QueryKind::StateAtVersion => "GET_STATE_AT_VERSION",
            QueryKind::AggregateSummary => "GET_AGGREGATE_SUMMARY",
        }
    }

    /// Cache lifetime used unless overridden on the dispatcher. Live views
    /// go stale quickly; a state pinned to a version never changes, so it
    /// keeps for much longer.
    pub fn default_ttl(self) -> Duration {
        match self {
            QueryKind::CurrentState => Duration::from_secs(5),
            QueryKind::EventHistory => Duration::from_secs(30),
            QueryKind::StateAtVersion => Duration::from_secs(300),
            QueryKind::AggregateSummary => Duration::from_secs(5),
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One query, as dispatched. Same flat wire shape as [`crate::command::Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: String,
    /// Unix epoch milliseconds at creation.
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: QueryBody,
}

impl Query {
    /// Build a query with a fresh UUID and the current wall-clock time.
    pub fn new(body: QueryBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: epoch_millis(),
            body,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), DispatchError> {
        if self.id.is_empty() || self.timestamp == 0 {
            return Err(DispatchError::InvalidQuery(
                self.body.kind().as_str().to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a handled query, annotated with cache provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when this result was served from the cache.
    pub from_cache: bool,
    /// True when the cache lookup for this dispatch found a live entry.
    pub cache_hit: bool,
    /// Time spent producing this result; zero for cache hits.
    pub duration_ms: u64,
}

impl QueryResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            from_cache: false,
            cache_hit: false,
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            from_cache: false,
            cache_hit: false,
            duration_ms: 0,
        }
    }
}

/// Executes queries of one or more kinds against some read model.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// # Errors
    ///
    /// Structural failures only; an operation that merely did not succeed
    /// belongs in the returned [`QueryResult`].
    async fn handle(
        &self,
        query: &Query,
        context: &DispatchContext,
    ) -> Result<QueryResult, DispatchError>;

    /// Cache key for this query, or `None` to opt the query out of
    /// caching. Keys must change whenever the underlying data can.
    async fn cache_key(&self, _query: &Query) -> Option<String> {
        None
    }
}

struct CacheEntry {
    result: QueryResult,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Point-in-time view of the query cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Routes queries to registered handlers through a middleware chain, with
/// a TTL cache in front.
///
/// The cache is consulted before any middleware runs: a live entry is
/// returned immediately, annotated as a hit. On a miss the chain runs as
/// for commands, and a successful result is stored under the handler's
/// key. Entries expire lazily on lookup; an expired entry counts as a
/// miss. Caching is skipped entirely when the [`DispatchContext`] disables
/// it or the handler returns no key.
#[derive(Default)]
pub struct QueryDispatcher {
    handlers: HashMap<QueryKind, Arc<dyn QueryHandler>>,
    middleware: Vec<Arc<dyn QueryMiddleware>>,
    ttl_overrides: HashMap<QueryKind, Duration>,
    cache: tokio::sync::Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for QueryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDispatcher")
            .field("handlers", &self.handlers.len())
            .field("middleware", &self.middleware.len())
            .field("ttl_overrides", &self.ttl_overrides)
            .finish_non_exhaustive()
    }
}

impl QueryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one query kind, replacing any previous
    /// registration.
    pub fn register_handler(&mut self, kind: QueryKind, handler: Arc<dyn QueryHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Append a middleware; chains run in registration order.
    pub fn add_middleware(&mut self, middleware: Arc<dyn QueryMiddleware>) {
        self.middleware.push(middleware);
    }

    /// Override the cache lifetime for one query kind.
    pub fn set_ttl(&mut self, kind: QueryKind, ttl: Duration) {
        self.ttl_overrides.insert(kind, ttl);
    }

    fn ttl_for(&self, kind: QueryKind) -> Duration {
        self.ttl_overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_ttl())
    }

    /// Drop every cached result. Hit and miss counters are kept.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        tracing::debug!("query cache cleared");
    }

    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            size: self.cache.lock().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Dispatch one query.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidQuery`] for a malformed envelope,
    /// [`DispatchError::NoQueryHandler`] for an unregistered kind, and
    /// whatever the handler itself returns.
    pub async fn dispatch(
        &self,
        mut query: Query,
        mut context: DispatchContext,
    ) -> Result<QueryResult, DispatchError> {
        match self.run(&mut query, &mut context).await {
            Ok(result) => Ok(result),
            Err(error) => {
                for middleware in &self.middleware {
                    middleware.on_error(&query, &error, &context).await;
                }
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        query: &mut Query,
        context: &mut DispatchContext,
    ) -> Result<QueryResult, DispatchError> {
        query.validate()?;
        let kind = query.body.kind();
        let handler = self
            .handlers
            .get(&kind)
            .map(Arc::clone)
            .ok_or_else(|| DispatchError::NoQueryHandler(kind.as_str().to_string()))?;

        let cache_key = if context.cache_enabled {
            handler.cache_key(query).await
        } else {
            None
        };

        if let Some(key) = &cache_key {
            match self.lookup(key).await {
                Some(result) => {
                    tracing::debug!(query = %kind, key = %key, "query served from cache");
                    return Ok(result);
                }
                None => tracing::debug!(query = %kind, key = %key, "query cache miss"),
            }
        }

        for middleware in &self.middleware {
            middleware.before_handle(query, context).await;
        }
        tracing::debug!(query = %kind, id = %query.id, "dispatching query");
        let started = Instant::now();
        let mut result = handler.handle(query, context).await?;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.from_cache = false;
        result.cache_hit = false;
        for middleware in &self.middleware {
            middleware.after_handle(query, &mut result, context).await;
        }

        if result.success {
            if let Some(key) = cache_key {
                self.cache.lock().await.insert(
                    key,
                    CacheEntry {
                        result: result.clone(),
                        stored_at: Instant::now(),
                        ttl: self.ttl_for(kind),
                    },
                );
            }
        }
        Ok(result)
    }

    /// Cache lookup with lazy expiry. Updates the hit and miss counters.
    async fn lookup(&self, key: &str) -> Option<QueryResult> {
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(entry) if !entry.expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut result = entry.result.clone();
                result.from_cache = true;
                result.cache_hit = true;
                result.duration_ms = 0;
                Some(result)
            }
            Some(_) => {
                cache.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}
