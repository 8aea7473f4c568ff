//! Event-sourced scheduler over one [`EventStore`] stream.
//!
//! Presents the same mutation surface as [`SchedulerEngine`], but every
//! state transition is first persisted as one or more domain events and
//! only then applied to the in-memory projection, through the same pure
//! reducer a replay uses. The persisted log and the live projection
//! therefore cannot diverge.
//!
//! Failure handling is asymmetric on purpose: an optimistic-concurrency
//! conflict from the store is returned as an `Err` so the caller can react
//! to the stale version, while every other failure is converted into a
//! failure result after a best-effort `EXECUTION_ERROR` event.
//!
//! [`SchedulerEngine`]: crate::engine::SchedulerEngine

use uuid::Uuid;

use crate::clock::{SimClock, epoch_millis};
use crate::engine::{EventLoopState, OpResult, Operation, SchedulerConfig, SideEffect, StateChange};
use crate::error::{EngineError, EventStoreError, ReplayError};
use crate::event::{
    DomainEvent, EventMetadata, SchedulerEvent, decode_scheduler_event, encode_scheduler_event,
};
use crate::queue::{BoundedQueue, QueueKind};
use crate::store::EventStore;
use crate::task::{CallStackFrame, MacrotaskItem, MicrotaskItem, MicrotaskSource, Phase, Priority};

/// Scheduler whose state is derived entirely from an event stream.
#[derive(Debug)]
pub struct EventSourcedScheduler {
    store: EventStore,
    aggregate_id: String,
    version: u64,
    state: EventLoopState,
    config: SchedulerConfig,
    clock: SimClock,
    session_id: Option<String>,
}

impl EventSourcedScheduler {
    /// Open a fresh stream with a generated aggregate ID and record the
    /// configuration event at version 1.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the initial append fails.
    pub async fn new(store: EventStore, config: SchedulerConfig) -> Result<Self, EventStoreError> {
        let aggregate_id = format!("scheduler-{}", Uuid::new_v4());
        Self::with_aggregate_id(store, aggregate_id, config).await
    }

    /// Open a stream under a caller-chosen aggregate ID.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the stream already exists, since the
    /// configuration event must be its first entry.
    pub async fn with_aggregate_id(
        store: EventStore,
        aggregate_id: impl Into<String>,
        config: SchedulerConfig,
    ) -> Result<Self, EventStoreError> {
        let mut scheduler = Self {
            store,
            aggregate_id: aggregate_id.into(),
            version: 0,
            state: EventLoopState::new(&config),
            config,
            clock: SimClock::new(),
            session_id: None,
        };
        scheduler
            .record(vec![SchedulerEvent::EngineConfigured { config }])
            .await?;
        Ok(scheduler)
    }

    /// Tag every subsequently recorded event with a session ID.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Version of the last event this scheduler recorded.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &EventLoopState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn event_store(&self) -> &EventStore {
        &self.store
    }

    /// Current simulated time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Moves simulated time forward, making delayed macrotasks eligible.
    pub fn advance_clock(&mut self, delta_ms: u64) {
        self.clock.advance(delta_ms);
    }

    /// Every event of this stream, in version order.
    pub async fn event_history(&self) -> Vec<DomainEvent> {
        self.store.get_events(&self.aggregate_id, None, None).await
    }

    /// Events of this stream matching an exact type tag.
    pub async fn events_by_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.store
            .events_by_type(&self.aggregate_id, event_type)
            .await
    }

    /// Pushes a frame onto the call stack by recording a push event.
    ///
    /// # Errors
    ///
    /// Only a concurrency conflict is returned as `Err`; every other
    /// failure comes back inside the result.
    pub async fn push_to_call_stack(
        &mut self,
        mut frame: CallStackFrame,
    ) -> Result<OpResult, EventStoreError> {
        if frame.created_at == 0 {
            frame.created_at = self.clock.now_ms();
        }
        if self.state.queues.call_stack().is_full() {
            let error = EngineError::StackOverflow {
                capacity: self.config.max_call_stack,
            };
            return Ok(self.fail(Operation::Push, error).await);
        }
        let (id, name) = (frame.id, frame.name.clone());
        self.commit(
            Operation::Push,
            vec![SchedulerEvent::FunctionPushed { frame }],
            StateChange::FramePushed { id, name },
            Vec::new(),
        )
        .await
    }

    /// Pops the top frame by recording a pop event carrying the completed
    /// frame.
    pub async fn pop_from_call_stack(&mut self) -> Result<OpResult, EventStoreError> {
        let top = self.state.queues.call_stack().peek().cloned();
        let Some(mut frame) = top else {
            return Ok(self.fail(Operation::Pop, EngineError::StackEmpty).await);
        };
        frame.mark_completed(self.clock.now_ms());
        self.commit(
            Operation::Pop,
            vec![SchedulerEvent::FunctionPopped {
                frame: frame.clone(),
            }],
            StateChange::FramePopped { frame },
            Vec::new(),
        )
        .await
    }

    /// Enqueues a microtask. The recorded event carries the item fully
    /// normalized (promise coercion applied), so replays never re-derive
    /// priorities.
    pub async fn enqueue_microtask(
        &mut self,
        mut item: MicrotaskItem,
    ) -> Result<OpResult, EventStoreError> {
        if item.created_at == 0 {
            item.created_at = self.clock.now_ms();
        }
        if item.source == MicrotaskSource::Promise {
            item.priority = Priority::High;
        }
        if self.state.queues.microtasks().is_full() {
            let error = EngineError::QueueFull {
                queue: QueueKind::Microtask,
                capacity: self.config.max_microtasks,
            };
            return Ok(self.fail(Operation::EnqueueMicrotask, error).await);
        }
        let (id, name, priority) = (item.id, item.name.clone(), item.priority);
        self.commit(
            Operation::EnqueueMicrotask,
            vec![SchedulerEvent::MicrotaskEnqueued { task: item }],
            StateChange::MicrotaskEnqueued { id, name, priority },
            Vec::new(),
        )
        .await
    }

    /// Enqueues a macrotask. The due time is resolved against the simulated
    /// clock before recording, so the event is self-contained.
    pub async fn enqueue_macrotask(
        &mut self,
        mut item: MacrotaskItem,
    ) -> Result<OpResult, EventStoreError> {
        let now = self.clock.now_ms();
        if item.created_at == 0 {
            item.created_at = now;
        }
        let due = item
            .scheduled_at
            .unwrap_or_else(|| now.saturating_add(item.delay));
        item.scheduled_at = Some(due);
        if self.state.queues.macrotasks().is_full() {
            let error = EngineError::QueueFull {
                queue: QueueKind::Macrotask,
                capacity: self.config.max_macrotasks,
            };
            return Ok(self.fail(Operation::EnqueueMacrotask, error).await);
        }
        let (id, name) = (item.id, item.name.clone());
        self.commit(
            Operation::EnqueueMacrotask,
            vec![SchedulerEvent::MacrotaskEnqueued { task: item }],
            StateChange::MacrotaskEnqueued {
                id,
                name,
                scheduled_at: due,
            },
            Vec::new(),
        )
        .await
    }

    /// Runs one scheduling step, persisting the whole tick as one atomic
    /// batch of events.
    ///
    /// The batch is staged against a scratch copy of the state first, so a
    /// rejected append leaves the projection untouched.
    pub async fn tick(&mut self) -> Result<OpResult, EventStoreError> {
        let now = self.clock.now_ms();
        let mut scratch = self.state.clone();
        let mut events = Vec::new();
        let mut side_effects = Vec::new();

        let tick = scratch.current_tick + 1;
        stage(&mut scratch, &mut events, SchedulerEvent::TickStarted { tick });

        let mut microtasks_processed = 0;
        let mut macrotasks_processed = 0;

        if scratch.queues.call_stack().is_empty() && !scratch.queues.microtasks().is_empty() {
            // Drain every queued microtask; the macrotask phase is not
            // attempted in this tick.
            while let Some(task) = scratch.queues.microtasks().peek().cloned() {
                stage(
                    &mut scratch,
                    &mut events,
                    SchedulerEvent::MicrotaskDequeued { task_id: task.id },
                );
                let mut executed = task;
                executed.mark_executed(now);
                side_effects.push(SideEffect::MicrotaskExecuted {
                    task: executed.clone(),
                });
                stage(
                    &mut scratch,
                    &mut events,
                    SchedulerEvent::MicrotaskExecuted { task: executed },
                );
                microtasks_processed += 1;
            }
        } else if scratch.queues.call_stack().is_empty() && scratch.queues.microtasks().is_empty() {
            let ready = scratch
                .queues
                .macrotasks()
                .ready_tasks(now)
                .into_iter()
                .next()
                .cloned();
            if let Some(task) = ready {
                stage(
                    &mut scratch,
                    &mut events,
                    SchedulerEvent::MacrotaskDequeued { task_id: task.id },
                );
                let mut executed = task;
                executed.mark_executed(now);
                side_effects.push(SideEffect::MacrotaskExecuted {
                    task: executed.clone(),
                });
                stage(
                    &mut scratch,
                    &mut events,
                    SchedulerEvent::MacrotaskExecuted { task: executed },
                );
                macrotasks_processed += 1;
            }
        }

        if scratch.queues.all_empty() {
            stage(
                &mut scratch,
                &mut events,
                SchedulerEvent::PhaseChanged { phase: Phase::Idle },
            );
            side_effects.push(SideEffect::PhaseChanged { phase: Phase::Idle });
        }
        stage(
            &mut scratch,
            &mut events,
            SchedulerEvent::TickCompleted {
                tick,
                microtasks_processed,
                macrotasks_processed,
            },
        );

        self.commit(
            Operation::Tick,
            events,
            StateChange::TickAdvanced { tick },
            side_effects,
        )
        .await
    }

    /// Records a reset event. The stream itself is append-only, so history
    /// survives; only the projection returns to its initial shape.
    pub async fn reset(&mut self) -> Result<OpResult, EventStoreError> {
        let result = self
            .commit(
                Operation::Reset,
                vec![SchedulerEvent::EngineReset],
                StateChange::Reset,
                Vec::new(),
            )
            .await?;
        if result.success {
            self.clock = SimClock::new();
        }
        Ok(result)
    }

    /// Reconstructs the projection as of `version` by replaying the actual
    /// recorded events, without touching this scheduler or its store.
    ///
    /// A throwaway scheduler is built over a brand-new isolated store; its
    /// own configuration event occupies version 1, so the live stream's
    /// events from version 2 onward are re-applied through the reducer.
    /// Unknown event types are skipped.
    ///
    /// # Errors
    ///
    /// [`ReplayError::VersionOutOfRange`] if `version` exceeds the current
    /// version.
    pub async fn replay_to_version(&self, version: u64) -> Result<EventLoopState, ReplayError> {
        if version > self.version {
            return Err(ReplayError::VersionOutOfRange {
                requested: version,
                current: self.version,
            });
        }
        let mut replayed = EventSourcedScheduler::with_aggregate_id(
            EventStore::new(),
            self.aggregate_id.clone(),
            self.config,
        )
        .await?;
        for record in self
            .store
            .get_events(&self.aggregate_id, Some(2), Some(version))
            .await
        {
            match decode_scheduler_event(&record) {
                Some(event) => apply_event(&mut replayed.state, &event),
                None => tracing::debug!(
                    event_type = %record.event_type,
                    version = record.version,
                    "skipping unknown event during replay"
                ),
            }
        }
        Ok(replayed.state)
    }

    fn metadata(&self) -> Option<EventMetadata> {
        self.session_id.clone().map(|session_id| {
            EventMetadata::default()
                .with_session_id(session_id)
                .with_source("scheduler")
        })
    }

    /// Append events to the stream, then fold them into the projection.
    /// The projection is only touched once the whole batch is persisted.
    async fn record(&mut self, events: Vec<SchedulerEvent>) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let base = self.version;
        let timestamp = epoch_millis();
        let mut records = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let record = encode_scheduler_event(
                event,
                &self.aggregate_id,
                base + 1 + offset as u64,
                timestamp,
                self.metadata(),
            )
            .map_err(|err| EventStoreError::Encoding(err.to_string()))?;
            records.push(record);
        }
        self.version = self
            .store
            .append_events(&self.aggregate_id, base, records)
            .await?;
        for (offset, event) in events.iter().enumerate() {
            tracing::debug!(
                aggregate_id = %self.aggregate_id,
                version = base + 1 + offset as u64,
                event_type = event.event_type(),
                "event recorded"
            );
            apply_event(&mut self.state, event);
        }
        Ok(())
    }

    async fn commit(
        &mut self,
        operation: Operation,
        events: Vec<SchedulerEvent>,
        state_change: StateChange,
        side_effects: Vec<SideEffect>,
    ) -> Result<OpResult, EventStoreError> {
        match self.record(events).await {
            Ok(()) => Ok(OpResult::succeeded_with(state_change, side_effects)),
            Err(err) if err.is_conflict() => Err(err),
            Err(err) => {
                let error = EngineError::Execution {
                    operation: operation.as_str().to_string(),
                    reason: err.to_string(),
                };
                Ok(self.fail(operation, error).await)
            }
        }
    }

    /// Convert a failure into a result, first attempting to record an
    /// `EXECUTION_ERROR` event. A failure of that recording is only logged
    /// so it cannot mask the original error.
    async fn fail(&mut self, operation: Operation, error: EngineError) -> OpResult {
        let event = SchedulerEvent::ExecutionError {
            operation: operation.as_str().to_string(),
            reason: error.to_string(),
        };
        if let Err(record_err) = self.record(vec![event]).await {
            tracing::warn!(
                operation = %operation,
                error = %record_err,
                "failed to record execution error event"
            );
        }
        OpResult::failed(error)
    }
}

fn stage(scratch: &mut EventLoopState, events: &mut Vec<SchedulerEvent>, event: SchedulerEvent) {
    apply_event(scratch, &event);
    events.push(event);
}

/// Fold one event into a projection.
///
/// Total and clock-free: events arrive fully normalized, executed/error
/// events are pure audit records, and capacity was enforced when the event
/// was recorded, so inserts here cannot legitimately fail.
fn apply_event(state: &mut EventLoopState, event: &SchedulerEvent) {
    match event {
        SchedulerEvent::EngineConfigured { config } => {
            *state = EventLoopState::new(config);
        }
        SchedulerEvent::FunctionPushed { frame } => {
            let _ = state.queues.call_stack_mut().push(frame.clone());
        }
        SchedulerEvent::FunctionPopped { .. } => {
            state.queues.call_stack_mut().pop();
        }
        SchedulerEvent::MicrotaskEnqueued { task } => {
            let _ = state.queues.microtasks_mut().enqueue(task.clone());
        }
        SchedulerEvent::MicrotaskDequeued { task_id } => {
            let remaining: Vec<MicrotaskItem> = state
                .queues
                .microtasks()
                .iter()
                .filter(|task| task.id != *task_id)
                .cloned()
                .collect();
            state.queues.microtasks_mut().replace_items(remaining);
        }
        SchedulerEvent::MacrotaskEnqueued { task } => {
            let _ = state.queues.macrotasks_mut().enqueue_at(task.clone(), 0);
        }
        SchedulerEvent::MacrotaskDequeued { task_id } => {
            let remaining: Vec<MacrotaskItem> = state
                .queues
                .macrotasks()
                .iter()
                .filter(|task| task.id != *task_id)
                .cloned()
                .collect();
            state.queues.macrotasks_mut().replace_items(remaining);
        }
        SchedulerEvent::TickStarted { tick } => {
            state.current_tick = *tick;
            state.is_running = true;
            state.phase = Phase::Poll;
        }
        SchedulerEvent::PhaseChanged { phase } => {
            state.phase = *phase;
            if *phase == Phase::Idle {
                state.is_running = false;
            }
        }
        SchedulerEvent::EngineReset => {
            let config = SchedulerConfig::default()
                .with_max_call_stack(state.queues.call_stack().capacity())
                .with_max_microtasks(state.queues.microtasks().capacity())
                .with_max_macrotasks(state.queues.macrotasks().capacity());
            *state = EventLoopState::new(&config);
        }
        // Pure audit records; the dequeue events already moved the state.
        SchedulerEvent::MicrotaskExecuted { .. }
        | SchedulerEvent::MacrotaskExecuted { .. }
        | SchedulerEvent::TickCompleted { .. }
        | SchedulerEvent::ExecutionError { .. } => {}
    }
}
