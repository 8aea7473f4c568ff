//! The non-sourced scheduler engine.
//!
//! One mutable [`EventLoopState`] driven by an explicit tick algorithm: a
//! tick drains every queued microtask while the call stack is empty, or
//! else runs at most one due macrotask. Once microtasks ran in a tick, the
//! macrotask phase is not attempted until the next tick. Every public
//! mutation returns an [`OpResult`] and appends itself to an execution
//! history; `tick` additionally notifies registered subscribers with the
//! post-tick state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::SimClock;
use crate::error::{EngineError, panic_reason};
use crate::queue::{BoundedQueue, MacrotaskQueue};
use crate::system::QueueSystem;
use crate::task::{CallStackFrame, MacrotaskItem, MicrotaskItem, Phase, TaskId};

/// Capacity and timeout settings for one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub max_call_stack: usize,
    pub max_microtasks: usize,
    pub max_macrotasks: usize,
    /// Declared execution budget in simulated milliseconds. Nothing in the
    /// tick loop measures against it; policies may act on it through
    /// [`ExecutionPolicy::handle_timeout`].
    pub execution_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_call_stack: 1000,
            max_microtasks: 1000,
            max_macrotasks: 1000,
            execution_timeout_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_call_stack(mut self, capacity: usize) -> Self {
        self.max_call_stack = capacity;
        self
    }

    pub fn with_max_microtasks(mut self, capacity: usize) -> Self {
        self.max_microtasks = capacity;
        self
    }

    pub fn with_max_macrotasks(mut self, capacity: usize) -> Self {
        self.max_macrotasks = capacity;
        self
    }

    pub fn with_execution_timeout_ms(mut self, budget_ms: u64) -> Self {
        self.execution_timeout_ms = budget_ms;
        self
    }
}

/// Complete observable state of one scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLoopState {
    pub phase: Phase,
    pub is_running: bool,
    pub current_tick: u64,
    pub queues: QueueSystem,
}

impl EventLoopState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            phase: Phase::Idle,
            is_running: false,
            current_tick: 0,
            queues: QueueSystem::new(
                config.max_call_stack,
                config.max_microtasks,
                config.max_macrotasks,
            ),
        }
    }
}

/// State delta described by a successful operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StateChange {
    FramePushed { id: TaskId, name: String },
    /// Carries the completed frame, since it has left the state.
    FramePopped { frame: CallStackFrame },
    MicrotaskEnqueued {
        id: TaskId,
        name: String,
        /// Priority as stored, after any promise coercion.
        priority: crate::task::Priority,
    },
    MacrotaskEnqueued {
        id: TaskId,
        name: String,
        scheduled_at: u64,
    },
    TickAdvanced { tick: u64 },
    Reset,
    None,
}

/// Observable work performed during an operation, mostly by `tick`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SideEffect {
    MicrotaskExecuted { task: MicrotaskItem },
    MacrotaskExecuted { task: MacrotaskItem },
    PhaseChanged { phase: Phase },
}

/// Outcome of one engine operation. Failures are reported here, never
/// thrown: `success` is false and `error` carries the typed failure.
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult {
    pub success: bool,
    pub state_change: StateChange,
    pub side_effects: Vec<SideEffect>,
    pub error: Option<EngineError>,
}

impl OpResult {
    pub(crate) fn succeeded(state_change: StateChange) -> Self {
        Self {
            success: true,
            state_change,
            side_effects: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn succeeded_with(state_change: StateChange, side_effects: Vec<SideEffect>) -> Self {
        Self {
            success: true,
            state_change,
            side_effects,
            error: None,
        }
    }

    pub(crate) fn failed(error: EngineError) -> Self {
        Self {
            success: false,
            state_change: StateChange::None,
            side_effects: Vec::new(),
            error: Some(error),
        }
    }
}

/// Names of the engine's mutating operations, as recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Push,
    Pop,
    EnqueueMicrotask,
    EnqueueMacrotask,
    Tick,
    Reset,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Push => "pushToCallStack",
            Operation::Pop => "popFromCallStack",
            Operation::EnqueueMicrotask => "enqueueMicrotask",
            Operation::EnqueueMacrotask => "enqueueMacrotask",
            Operation::Tick => "tick",
            Operation::Reset => "reset",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the execution history.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub operation: Operation,
    /// Tick counter at the time the operation completed.
    pub tick: u64,
    /// Simulated clock reading at the time of the operation.
    pub at_ms: u64,
    pub result: OpResult,
}

/// Pluggable scheduling decisions consulted by [`SchedulerEngine::tick`].
///
/// The provided defaults implement the standard rules; substitute an
/// implementation to alter scheduling for tests or experiments.
pub trait ExecutionPolicy: Send + Sync {
    /// Whether this tick should drain the microtask queue.
    fn should_process_microtasks(&self, state: &EventLoopState) -> bool {
        state.queues.call_stack().is_empty() && !state.queues.microtasks().is_empty()
    }

    /// Whether this tick may run a macrotask. Only consulted when the
    /// microtask branch did not run.
    fn should_process_macrotask(&self, state: &EventLoopState) -> bool {
        state.queues.call_stack().is_empty() && state.queues.microtasks().is_empty()
    }

    /// Picks the macrotask to run, if one is due at `now_ms`.
    fn next_macrotask(&self, queue: &mut MacrotaskQueue, now_ms: u64) -> Option<MacrotaskItem> {
        queue.dequeue_ready(now_ms)
    }

    /// Builds the error reported when a push exceeds the stack capacity.
    fn handle_stack_overflow(&self, _frame: &CallStackFrame, capacity: usize) -> EngineError {
        EngineError::StackOverflow { capacity }
    }

    /// Builds the error reported when an operation exceeds the configured
    /// execution budget. The default engine never measures elapsed time, so
    /// this fires only from custom callers.
    fn handle_timeout(&self, operation: &str, budget_ms: u64) -> EngineError {
        EngineError::Execution {
            operation: operation.to_string(),
            reason: format!("exceeded execution budget of {budget_ms}ms"),
        }
    }
}

/// The standard scheduling rules, unchanged from the trait defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl ExecutionPolicy for DefaultPolicy {}

/// Handle returned by [`SchedulerEngine::on_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickSubscriptionId(u64);

type TickCallback = Box<dyn Fn(&EventLoopState) + Send>;

/// The non-sourced simulation engine.
pub struct SchedulerEngine {
    state: EventLoopState,
    config: SchedulerConfig,
    policy: Arc<dyn ExecutionPolicy>,
    clock: SimClock,
    history: Vec<ExecutionRecord>,
    tick_subscribers: Vec<(TickSubscriptionId, TickCallback)>,
    next_subscription: u64,
}

impl std::fmt::Debug for SchedulerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerEngine")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("history_len", &self.history.len())
            .field("subscribers", &self.tick_subscribers.len())
            .finish_non_exhaustive()
    }
}

impl Default for SchedulerEngine {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl SchedulerEngine {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_policy(config, Arc::new(DefaultPolicy))
    }

    pub fn with_policy(config: SchedulerConfig, policy: Arc<dyn ExecutionPolicy>) -> Self {
        Self {
            state: EventLoopState::new(&config),
            config,
            policy,
            clock: SimClock::new(),
            history: Vec::new(),
            tick_subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn state(&self) -> &EventLoopState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn execution_history(&self) -> &[ExecutionRecord] {
        &self.history
    }

    /// Current simulated time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Moves simulated time forward, making delayed macrotasks eligible.
    pub fn advance_clock(&mut self, delta_ms: u64) {
        self.clock.advance(delta_ms);
    }

    /// Pushes a frame onto the call stack. At capacity the configured
    /// policy's overflow handler supplies the reported error.
    pub fn push_to_call_stack(&mut self, mut frame: CallStackFrame) -> OpResult {
        if frame.created_at == 0 {
            frame.created_at = self.clock.now_ms();
        }
        let (id, name) = (frame.id, frame.name.clone());
        let result = match self.state.queues.call_stack_mut().push(frame.clone()) {
            Ok(()) => OpResult::succeeded(StateChange::FramePushed { id, name }),
            Err(EngineError::StackOverflow { .. }) => {
                let error = self
                    .policy
                    .handle_stack_overflow(&frame, self.config.max_call_stack);
                OpResult::failed(error)
            }
            Err(other) => OpResult::failed(other),
        };
        self.record(Operation::Push, &result);
        result
    }

    /// Pops the top frame, marking it completed. Fails on an empty stack.
    pub fn pop_from_call_stack(&mut self) -> OpResult {
        let now = self.clock.now_ms();
        let result = match self.state.queues.call_stack_mut().pop() {
            Some(mut frame) => {
                frame.mark_completed(now);
                OpResult::succeeded(StateChange::FramePopped { frame })
            }
            None => OpResult::failed(EngineError::StackEmpty),
        };
        self.record(Operation::Pop, &result);
        result
    }

    pub fn enqueue_microtask(&mut self, mut item: MicrotaskItem) -> OpResult {
        if item.created_at == 0 {
            item.created_at = self.clock.now_ms();
        }
        let (id, name) = (item.id, item.name.clone());
        let result = match self.state.queues.microtasks_mut().enqueue(item) {
            Ok(()) => {
                // Re-read the stored priority so the result reflects any
                // promise coercion.
                let priority = self
                    .state
                    .queues
                    .microtasks()
                    .iter()
                    .find(|stored| stored.id == id)
                    .map(|stored| stored.priority)
                    .unwrap_or_default();
                OpResult::succeeded(StateChange::MicrotaskEnqueued { id, name, priority })
            }
            Err(error) => OpResult::failed(error),
        };
        self.record(Operation::EnqueueMicrotask, &result);
        result
    }

    pub fn enqueue_macrotask(&mut self, mut item: MacrotaskItem) -> OpResult {
        let now = self.clock.now_ms();
        if item.created_at == 0 {
            item.created_at = now;
        }
        let due = item
            .scheduled_at
            .unwrap_or_else(|| now.saturating_add(item.delay));
        item.scheduled_at = Some(due);
        let (id, name) = (item.id, item.name.clone());
        let result = match self.state.queues.macrotasks_mut().enqueue_at(item, now) {
            Ok(()) => OpResult::succeeded(StateChange::MacrotaskEnqueued {
                id,
                name,
                scheduled_at: due,
            }),
            Err(error) => OpResult::failed(error),
        };
        self.record(Operation::EnqueueMacrotask, &result);
        result
    }

    /// Runs one step of the scheduling loop.
    ///
    /// Any panic out of the processing path (for example from a custom
    /// policy) is caught and converted into a failure result with
    /// `is_running` cleared; `tick` itself never unwinds.
    pub fn tick(&mut self) -> OpResult {
        // 1. Open the tick: the loop is live and looking for work.
        self.state.current_tick += 1;
        self.state.is_running = true;
        self.state.phase = Phase::Poll;
        let tick = self.state.current_tick;

        // 2. Process one wave of work.
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_tick()));

        let result = match outcome {
            Ok(mut side_effects) => {
                // 3. Settle the phase: an empty system goes idle.
                if self.state.queues.all_empty() {
                    self.state.phase = Phase::Idle;
                    self.state.is_running = false;
                    side_effects.push(SideEffect::PhaseChanged { phase: Phase::Idle });
                }
                OpResult::succeeded_with(StateChange::TickAdvanced { tick }, side_effects)
            }
            Err(payload) => {
                self.state.is_running = false;
                OpResult::failed(EngineError::Execution {
                    operation: Operation::Tick.as_str().to_string(),
                    reason: panic_reason(payload),
                })
            }
        };
        self.record(Operation::Tick, &result);

        // 4. Notify subscribers with the post-tick state.
        for (_, callback) in &self.tick_subscribers {
            callback(&self.state);
        }
        result
    }

    fn run_tick(&mut self) -> Vec<SideEffect> {
        let policy = Arc::clone(&self.policy);
        let now = self.clock.now_ms();
        let mut side_effects = Vec::new();

        if policy.should_process_microtasks(&self.state) {
            // Drain every queued microtask; the macrotask phase is not
            // attempted in this tick.
            while let Some(mut task) = self.state.queues.microtasks_mut().dequeue() {
                task.mark_executed(now);
                side_effects.push(SideEffect::MicrotaskExecuted { task });
            }
            return side_effects;
        }

        if policy.should_process_macrotask(&self.state) {
            match policy.next_macrotask(self.state.queues.macrotasks_mut(), now) {
                Some(mut task) => {
                    task.mark_executed(now);
                    side_effects.push(SideEffect::MacrotaskExecuted { task });
                }
                // Nothing due yet; the phase stays at poll.
                None => {}
            }
        }
        side_effects
    }

    /// Returns state, clock, and history to their initial values. Tick
    /// subscriptions survive a reset.
    pub fn reset(&mut self) -> OpResult {
        self.state = EventLoopState::new(&self.config);
        self.clock = SimClock::new();
        self.history.clear();
        tracing::debug!("engine reset");
        OpResult::succeeded(StateChange::Reset)
    }

    /// Builds a fresh engine with this engine's config and policy and ticks
    /// it `n` times, returning the resulting state.
    ///
    /// The original enqueue operations are not replayed, so state that
    /// depended on prior enqueues is absent from the result. The
    /// event-sourced scheduler's `replay_to_version` is the faithful
    /// variant.
    pub fn rewind_to_tick(&self, n: u64) -> EventLoopState {
        let mut fresh = SchedulerEngine::with_policy(self.config, Arc::clone(&self.policy));
        for _ in 0..n {
            fresh.tick();
        }
        fresh.state
    }

    /// Registers a callback invoked with the post-tick state after every
    /// `tick()`.
    pub fn on_tick(
        &mut self,
        callback: impl Fn(&EventLoopState) + Send + 'static,
    ) -> TickSubscriptionId {
        let id = TickSubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.tick_subscribers.push((id, Box::new(callback)));
        id
    }

    /// Removes a tick subscription; returns whether anything was removed.
    pub fn off_tick(&mut self, id: TickSubscriptionId) -> bool {
        let before = self.tick_subscribers.len();
        self.tick_subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.tick_subscribers.len() != before
    }

    fn record(&mut self, operation: Operation, result: &OpResult) {
        tracing::debug!(
            operation = %operation,
            success = result.success,
            tick = self.state.current_tick,
            "engine operation"
        );
        self.history.push(ExecutionRecord {
            operation,
            tick: self.state.current_tick,
            at_ms: self.clock.now_ms(),
            result: result.clone(),
        });
    }
}
