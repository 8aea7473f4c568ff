//! Concrete handlers wiring the dispatchers to an event-sourced scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::command::{
    Command, CommandBody, CommandDispatcher, CommandHandler, CommandKind, CommandResult,
    DispatchContext,
};
use crate::engine::OpResult;
use crate::error::DispatchError;
use crate::query::{Query, QueryBody, QueryDispatcher, QueryHandler, QueryKind, QueryResult};
use crate::sourced::EventSourcedScheduler;
use crate::task::{CallStackFrame, MacrotaskItem, MacrotaskSource, MicrotaskItem, MicrotaskSource};

/// Applies scheduler commands to one [`EventSourcedScheduler`].
///
/// Operational failures (full queue, empty stack) come back as failure
/// results with the engine error message; concurrency conflicts from the
/// store surface as [`DispatchError::Store`] so the caller can retry
/// against the rebuilt state.
#[derive(Debug)]
pub struct SchedulerCommandHandler {
    scheduler: Arc<Mutex<EventSourcedScheduler>>,
}

impl SchedulerCommandHandler {
    pub fn new(scheduler: Arc<Mutex<EventSourcedScheduler>>) -> Self {
        Self { scheduler }
    }

    /// Register `handler` for every command kind on `dispatcher`.
    pub fn register_all(handler: Arc<Self>, dispatcher: &mut CommandDispatcher) {
        for kind in CommandKind::ALL {
            dispatcher.register_handler(kind, Arc::clone(&handler) as Arc<dyn CommandHandler>);
        }
    }
}

fn op_data(result: &OpResult) -> Value {
    json!({
        "stateChange": result.state_change,
        "sideEffects": result.side_effects,
    })
}

fn into_command_result(result: OpResult, version: u64) -> CommandResult {
    if result.success {
        CommandResult::success_at(op_data(&result), version)
    } else {
        let message = result
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "operation failed".to_string());
        let mut failed = CommandResult::failure(message);
        failed.version = Some(version);
        failed
    }
}

#[async_trait]
impl CommandHandler for SchedulerCommandHandler {
    async fn handle(
        &self,
        command: &Command,
        _context: &DispatchContext,
    ) -> Result<CommandResult, DispatchError> {
        let mut scheduler = self.scheduler.lock().await;
        let result = match &command.body {
            CommandBody::PushFunction {
                function_name,
                priority,
                context,
            } => {
                let mut frame = CallStackFrame::new(function_name.clone());
                if let Some(priority) = priority {
                    frame = frame.with_priority(*priority);
                }
                if let Some(context) = context {
                    frame = frame.with_context(context.clone());
                }
                scheduler.push_to_call_stack(frame).await?
            }
            CommandBody::PopFunction => scheduler.pop_from_call_stack().await?,
            CommandBody::EnqueueMicrotask {
                task_name,
                priority,
                source,
                context,
            } => {
                let mut task = MicrotaskItem::new(
                    task_name.clone(),
                    source.unwrap_or(MicrotaskSource::QueueMicrotask),
                );
                if let Some(priority) = priority {
                    task = task.with_priority(*priority);
                }
                if let Some(context) = context {
                    task = task.with_context(context.clone());
                }
                scheduler.enqueue_microtask(task).await?
            }
            CommandBody::EnqueueMacrotask {
                task_name,
                delay,
                source,
                context,
            } => {
                let mut task = MacrotaskItem::new(
                    task_name.clone(),
                    source.unwrap_or(MacrotaskSource::SetTimeout),
                );
                if let Some(delay) = delay {
                    task = task.with_delay(*delay);
                }
                if let Some(context) = context {
                    task = task.with_context(context.clone());
                }
                scheduler.enqueue_macrotask(task).await?
            }
            CommandBody::ExecuteTick => scheduler.tick().await?,
            CommandBody::ResetEngine => scheduler.reset().await?,
            CommandBody::DequeueMicrotask { .. }
            | CommandBody::CancelMacrotask { .. }
            | CommandBody::PauseExecution
            | CommandBody::ResumeExecution => {
                tracing::debug!(
                    command = %command.body.kind(),
                    "command accepted without effect"
                );
                return Ok(CommandResult::success_at(
                    json!({"accepted": true, "applied": false}),
                    scheduler.version(),
                ));
            }
        };
        let version = scheduler.version();
        Ok(into_command_result(result, version))
    }
}

/// Serves read models from one [`EventSourcedScheduler`].
///
/// Every query carries a cache key of the form
/// `TYPE:aggregate:vN[:filters]`, so cached entries stop matching as soon
/// as the aggregate version moves. State-at-version queries key on the
/// requested version instead, since that answer never changes.
#[derive(Debug)]
pub struct SchedulerQueryHandler {
    scheduler: Arc<Mutex<EventSourcedScheduler>>,
}

impl SchedulerQueryHandler {
    pub fn new(scheduler: Arc<Mutex<EventSourcedScheduler>>) -> Self {
        Self { scheduler }
    }

    /// Register `handler` for every query kind on `dispatcher`.
    pub fn register_all(handler: Arc<Self>, dispatcher: &mut QueryDispatcher) {
        for kind in QueryKind::ALL {
            dispatcher.register_handler(kind, Arc::clone(&handler) as Arc<dyn QueryHandler>);
        }
    }
}

#[async_trait]
impl QueryHandler for SchedulerQueryHandler {
    async fn handle(
        &self,
        query: &Query,
        _context: &DispatchContext,
    ) -> Result<QueryResult, DispatchError> {
        let scheduler = self.scheduler.lock().await;
        let result = match &query.body {
            QueryBody::GetCurrentState => QueryResult::success(json!({
                "aggregateId": scheduler.aggregate_id(),
                "version": scheduler.version(),
                "state": scheduler.state(),
            })),
            QueryBody::GetEventHistory {
                event_type,
                limit,
                offset,
            } => {
                let events = match event_type {
                    Some(event_type) => scheduler.events_by_type(event_type).await,
                    None => scheduler.event_history().await,
                };
                let total = events.len();
                let offset = offset.unwrap_or(0);
                let events: Vec<_> = events
                    .into_iter()
                    .skip(offset)
                    .take(limit.unwrap_or(usize::MAX))
                    .collect();
                QueryResult::success(json!({
                    "events": events,
                    "total": total,
                    "offset": offset,
                }))
            }
            QueryBody::GetStateAtVersion { version } => {
                match scheduler.replay_to_version(*version).await {
                    Ok(state) => QueryResult::success(json!({
                        "version": version,
                        "state": state,
                    })),
                    Err(error) => QueryResult::failure(error.to_string()),
                }
            }
            QueryBody::GetAggregateSummary => {
                let stream = scheduler
                    .event_store()
                    .stream_info(scheduler.aggregate_id())
                    .await;
                let state = scheduler.state();
                QueryResult::success(json!({
                    "aggregateId": scheduler.aggregate_id(),
                    "version": scheduler.version(),
                    "phase": state.phase,
                    "isRunning": state.is_running,
                    "currentTick": state.current_tick,
                    "queues": state.queues.snapshot().counts,
                    "stream": stream,
                }))
            }
        };
        Ok(result)
    }

    async fn cache_key(&self, query: &Query) -> Option<String> {
        let scheduler = self.scheduler.lock().await;
        let kind = query.body.kind();
        let aggregate_id = scheduler.aggregate_id();
        let key = match &query.body {
            QueryBody::GetEventHistory {
                event_type,
                limit,
                offset,
            } => {
                let limit = limit.map_or_else(|| "all".to_string(), |limit| limit.to_string());
                format!(
                    "{kind}:{aggregate_id}:v{}:{}:{limit}:{}",
                    scheduler.version(),
                    event_type.as_deref().unwrap_or("*"),
                    offset.unwrap_or(0),
                )
            }
            QueryBody::GetStateAtVersion { version } => {
                format!("{kind}:{aggregate_id}:v{version}")
            }
            _ => format!("{kind}:{aggregate_id}:v{}", scheduler.version()),
        };
        Some(key)
    }
}
