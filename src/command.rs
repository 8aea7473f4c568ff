//! Command envelope, validation, and the command dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::epoch_millis;
use crate::error::DispatchError;
use crate::middleware::CommandMiddleware;
use crate::task::{MacrotaskSource, MicrotaskSource, Priority};

/// Cross-cutting dispatch settings passed alongside every command or
/// query.
///
/// Middleware may rewrite these in `before_handle`; handlers receive the
/// final values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchContext {
    /// Session issuing the command, forwarded into event metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Correlation ID for tracing one interaction across dispatches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Whether query results may be served from and stored in the cache.
    pub cache_enabled: bool,
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self {
            session_id: None,
            correlation_id: None,
            cache_enabled: true,
        }
    }
}

impl DispatchContext {
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }
}

/// Typed payload of a command, adjacently tagged so the wire shape is
/// `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum CommandBody {
    PushFunction {
        function_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    PopFunction,
    EnqueueMicrotask {
        task_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<MicrotaskSource>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    EnqueueMacrotask {
        task_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<MacrotaskSource>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    ExecuteTick,
    ResetEngine,
    /// Accepted but not yet acted on; reserved for targeted removal.
    DequeueMicrotask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    /// Accepted but not yet acted on; reserved for targeted cancellation.
    CancelMacrotask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    /// Accepted but not yet acted on.
    PauseExecution,
    /// Accepted but not yet acted on.
    ResumeExecution,
}

impl CommandBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandBody::PushFunction { .. } => CommandKind::PushFunction,
            CommandBody::PopFunction => CommandKind::PopFunction,
            CommandBody::EnqueueMicrotask { .. } => CommandKind::EnqueueMicrotask,
            CommandBody::EnqueueMacrotask { .. } => CommandKind::EnqueueMacrotask,
            CommandBody::ExecuteTick => CommandKind::ExecuteTick,
            CommandBody::ResetEngine => CommandKind::ResetEngine,
            CommandBody::DequeueMicrotask { .. } => CommandKind::DequeueMicrotask,
            CommandBody::CancelMacrotask { .. } => CommandKind::CancelMacrotask,
            CommandBody::PauseExecution => CommandKind::PauseExecution,
            CommandBody::ResumeExecution => CommandKind::ResumeExecution,
        }
    }
}

/// Registry key for command handlers; one per command type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    PushFunction,
    PopFunction,
    EnqueueMicrotask,
    EnqueueMacrotask,
    ExecuteTick,
    ResetEngine,
    DequeueMicrotask,
    CancelMacrotask,
    PauseExecution,
    ResumeExecution,
}

impl CommandKind {
    /// Every command kind, in declaration order.
    pub const ALL: [CommandKind; 10] = [
        CommandKind::PushFunction,
        CommandKind::PopFunction,
        CommandKind::EnqueueMicrotask,
        CommandKind::EnqueueMacrotask,
        CommandKind::ExecuteTick,
        CommandKind::ResetEngine,
        CommandKind::DequeueMicrotask,
        CommandKind::CancelMacrotask,
        CommandKind::PauseExecution,
        CommandKind::ResumeExecution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::PushFunction => "PUSH_FUNCTION",
            CommandKind::PopFunction => "POP_FUNCTION",
            CommandKind::EnqueueMicrotask => "ENQUEUE_MICROTASK",
            CommandKind::EnqueueMacrotask => "ENQUEUE_MACROTASK",
            CommandKind::ExecuteTick => "EXECUTE_TICK",
            CommandKind::ResetEngine => "RESET_ENGINE",
            CommandKind::DequeueMicrotask => "DEQUEUE_MICROTASK",
            CommandKind::CancelMacrotask => "CANCEL_MACROTASK",
            CommandKind::PauseExecution => "PAUSE_EXECUTION",
            CommandKind::ResumeExecution => "RESUME_EXECUTION",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command, as dispatched: an identity envelope around a typed body.
///
/// The body is flattened, so the wire shape is
/// `{"id", "timestamp", "type", "payload"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    /// Unix epoch milliseconds at creation.
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: CommandBody,
}

impl Command {
    /// Build a command with a fresh UUID and the current wall-clock time.
    pub fn new(body: CommandBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: epoch_millis(),
            body,
        }
    }

    /// Shape validation run before any handler sees the command.
    pub(crate) fn validate(&self) -> Result<(), DispatchError> {
        if self.id.is_empty() || self.timestamp == 0 {
            return Err(DispatchError::InvalidCommand(
                self.body.kind().as_str().to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a handled command. Operational failures live here;
/// structural dispatch failures are returned as errors instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Aggregate version after the command, when it reached a scheduler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl CommandResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            version: None,
        }
    }

    pub fn success_at(data: Value, version: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            version: Some(version),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            version: None,
        }
    }
}

/// Executes commands of one or more kinds against some target.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// # Errors
    ///
    /// Structural failures only; an operation that merely did not succeed
    /// belongs in the returned [`CommandResult`].
    async fn handle(
        &self,
        command: &Command,
        context: &DispatchContext,
    ) -> Result<CommandResult, DispatchError>;
}

/// Routes commands to registered handlers through a middleware chain.
///
/// Dispatch order: validate, look up the handler by type tag, run every
/// middleware's `before_handle` in registration order, invoke the handler,
/// run every `after_handle` in registration order. Any error from
/// validation onward first fans out to every middleware's `on_error`, then
/// is returned to the caller.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
    middleware: Vec<Arc<dyn CommandMiddleware>>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("handlers", &self.handlers.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one command kind, replacing any previous
    /// registration.
    pub fn register_handler(&mut self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Append a middleware; chains run in registration order.
    pub fn add_middleware(&mut self, middleware: Arc<dyn CommandMiddleware>) {
        self.middleware.push(middleware);
    }

    /// Dispatch one command.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidCommand`] for a malformed envelope,
    /// [`DispatchError::NoCommandHandler`] for an unregistered kind, and
    /// whatever the handler itself returns.
    pub async fn dispatch(
        &self,
        mut command: Command,
        mut context: DispatchContext,
    ) -> Result<CommandResult, DispatchError> {
        match self.run(&mut command, &mut context).await {
            Ok(result) => Ok(result),
            Err(error) => {
                for middleware in &self.middleware {
                    middleware.on_error(&command, &error, &context).await;
                }
                Err(error)
            }
        }
    }

    async fn run(
        &self,
        command: &mut Command,
        context: &mut DispatchContext,
    ) -> Result<CommandResult, DispatchError> {
        command.validate()?;
        let kind = command.body.kind();
        let handler = self
            .handlers
            .get(&kind)
            .map(Arc::clone)
            .ok_or_else(|| DispatchError::NoCommandHandler(kind.as_str().to_string()))?;

        for middleware in &self.middleware {
            middleware.before_handle(command, context).await;
        }
        tracing::debug!(command = %kind, id = %command.id, "dispatching command");
        let mut result = handler.handle(command, context).await?;
        for middleware in &self.middleware {
            middleware.after_handle(command, &mut result, context).await;
        }
        Ok(result)
    }
}
