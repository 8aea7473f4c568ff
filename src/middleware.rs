//! Middleware hooks for the command and query dispatchers.
//!
//! Every hook has a no-op default, so a middleware implements only the
//! stages it cares about. `before_handle` receives mutable access and may
//! rewrite the message or the [`DispatchContext`] before the handler runs.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use crate::command::{Command, CommandResult, DispatchContext};
use crate::error::DispatchError;
use crate::query::{Query, QueryResult};

/// Hooks around command dispatch.
#[async_trait]
pub trait CommandMiddleware: Send + Sync {
    async fn before_handle(&self, _command: &mut Command, _context: &mut DispatchContext) {}

    async fn after_handle(
        &self,
        _command: &Command,
        _result: &mut CommandResult,
        _context: &DispatchContext,
    ) {
    }

    /// Called once per middleware when dispatch fails at any stage.
    async fn on_error(
        &self,
        _command: &Command,
        _error: &DispatchError,
        _context: &DispatchContext,
    ) {
    }
}

/// Hooks around query dispatch. Cache hits bypass the chain entirely.
#[async_trait]
pub trait QueryMiddleware: Send + Sync {
    async fn before_handle(&self, _query: &mut Query, _context: &mut DispatchContext) {}

    async fn after_handle(
        &self,
        _query: &Query,
        _result: &mut QueryResult,
        _context: &DispatchContext,
    ) {
    }

    /// Called once per middleware when dispatch fails at any stage.
    async fn on_error(&self, _query: &Query, _error: &DispatchError, _context: &DispatchContext) {}
}

/// Structured-log middleware for both dispatchers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl CommandMiddleware for LoggingMiddleware {
    async fn before_handle(&self, command: &mut Command, context: &mut DispatchContext) {
        tracing::info!(
            command = %command.body.kind(),
            id = %command.id,
            session = ?context.session_id,
            "command received"
        );
    }

    async fn after_handle(
        &self,
        command: &Command,
        result: &mut CommandResult,
        _context: &DispatchContext,
    ) {
        tracing::info!(
            command = %command.body.kind(),
            success = result.success,
            "command handled"
        );
    }

    async fn on_error(
        &self,
        command: &Command,
        error: &DispatchError,
        _context: &DispatchContext,
    ) {
        tracing::error!(command = %command.body.kind(), %error, "command dispatch failed");
    }
}

#[async_trait]
impl QueryMiddleware for LoggingMiddleware {
    async fn before_handle(&self, query: &mut Query, context: &mut DispatchContext) {
        tracing::info!(
            query = %query.body.kind(),
            id = %query.id,
            cache_enabled = context.cache_enabled,
            "query received"
        );
    }

    async fn after_handle(
        &self,
        query: &Query,
        result: &mut QueryResult,
        _context: &DispatchContext,
    ) {
        tracing::info!(
            query = %query.body.kind(),
            success = result.success,
            from_cache = result.from_cache,
            "query handled"
        );
    }

    async fn on_error(&self, query: &Query, error: &DispatchError, _context: &DispatchContext) {
        tracing::error!(query = %query.body.kind(), %error, "query dispatch failed");
    }
}

/// Point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub commands_dispatched: u64,
    pub commands_failed: u64,
    pub command_errors: u64,
    pub queries_dispatched: u64,
    pub query_cache_hits: u64,
    pub query_errors: u64,
}

/// Counting middleware. Register one `Arc` with both dispatchers and keep
/// a clone to read [`MetricsMiddleware::snapshot`] from.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    commands_dispatched: AtomicU64,
    commands_failed: AtomicU64,
    command_errors: AtomicU64,
    queries_dispatched: AtomicU64,
    query_cache_hits: AtomicU64,
    query_errors: AtomicU64,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            queries_dispatched: self.queries_dispatched.load(Ordering::Relaxed),
            query_cache_hits: self.query_cache_hits.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl CommandMiddleware for MetricsMiddleware {
    async fn before_handle(&self, _command: &mut Command, _context: &mut DispatchContext) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    async fn after_handle(
        &self,
        _command: &Command,
        result: &mut CommandResult,
        _context: &DispatchContext,
    ) {
        if !result.success {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn on_error(
        &self,
        _command: &Command,
        _error: &DispatchError,
        _context: &DispatchContext,
    ) {
        self.command_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl QueryMiddleware for MetricsMiddleware {
    async fn before_handle(&self, _query: &mut Query, _context: &mut DispatchContext) {
        self.queries_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    async fn after_handle(
        &self,
        _query: &Query,
        result: &mut QueryResult,
        _context: &DispatchContext,
    ) {
        if result.cache_hit {
            self.query_cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn on_error(&self, _query: &Query, _error: &DispatchError, _context: &DispatchContext) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }
}
