//! A simulated JavaScript-style event loop: bounded queue primitives, a
//! tick-driven scheduler engine, and an event-sourced rendition with CQRS
//! dispatch and deterministic replay on top.

mod clock;
mod command;
mod engine;
mod error;
mod event;
mod handler;
mod middleware;
mod query;
mod queue;
mod sourced;
mod store;
mod system;
mod task;

pub use clock::SimClock;
pub use command::{
    Command, CommandBody, CommandDispatcher, CommandHandler, CommandKind, CommandResult,
    DispatchContext,
};
pub use engine::{
    DefaultPolicy, EventLoopState, ExecutionPolicy, ExecutionRecord, OpResult, Operation,
    SchedulerConfig, SchedulerEngine, SideEffect, StateChange, TickSubscriptionId,
};
pub use error::{DispatchError, EngineError, EventStoreError, ReplayError};
pub use event::{
    AGGREGATE_TYPE, DomainEvent, EventMetadata, SchedulerEvent, decode_scheduler_event,
    encode_scheduler_event,
};
pub use handler::{SchedulerCommandHandler, SchedulerQueryHandler};
pub use middleware::{
    CommandMiddleware, LoggingMiddleware, MetricsMiddleware, MetricsSnapshot, QueryMiddleware,
};
pub use query::{
    CacheStats, Query, QueryBody, QueryDispatcher, QueryHandler, QueryKind, QueryResult,
};
pub use queue::{BoundedQueue, CallStack, MacrotaskQueue, MicrotaskQueue, QueueKind};
pub use sourced::EventSourcedScheduler;
pub use store::{ALL_EVENTS, EventStore, EventStoreSnapshot, StreamInfo, SubscriptionId};
pub use system::{QueueCounts, QueueSnapshot, QueueSystem};
pub use task::{
    CallStackFrame, MacrotaskItem, MacrotaskSource, MicrotaskItem, MicrotaskSource, Phase,
    Priority, TaskId, TaskStatus,
};
