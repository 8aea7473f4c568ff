//! Task data model for the simulated scheduler.
//!
//! Three disjoint task shapes flow through the system: call-stack frames,
//! microtask items, and macrotask items. They share an identity, a priority,
//! and a lifecycle status; each variant adds the fields its queue needs.
//! Serialized spellings follow the JavaScript wire conventions (camelCase
//! fields, lowercase/camelCase enum values).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identity of a task, shared across all three variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. Lower rank means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Immediate,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank used for queue ordering: immediate=0 through low=3.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Immediate => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Immediate => "immediate",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Unknown priority strings decode as `normal` rather than failing, so task
// payloads written by newer producers still load.
impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "immediate" => Priority::Immediate,
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        })
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a microtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MicrotaskSource {
    Promise,
    QueueMicrotask,
    MutationObserver,
}

impl MicrotaskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MicrotaskSource::Promise => "promise",
            MicrotaskSource::QueueMicrotask => "queueMicrotask",
            MicrotaskSource::MutationObserver => "mutationObserver",
        }
    }
}

impl std::fmt::Display for MicrotaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a macrotask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MacrotaskSource {
    SetTimeout,
    SetInterval,
    SetImmediate,
    Io,
    Ui,
}

impl MacrotaskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MacrotaskSource::SetTimeout => "setTimeout",
            MacrotaskSource::SetInterval => "setInterval",
            MacrotaskSource::SetImmediate => "setImmediate",
            MacrotaskSource::Io => "io",
            MacrotaskSource::Ui => "ui",
        }
    }
}

impl std::fmt::Display for MacrotaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current stage of the scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Poll,
    Check,
    Close,
    Timers,
    Pending,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Poll => "poll",
            Phase::Check => "check",
            Phase::Close => "close",
            Phase::Timers => "timers",
            Phase::Pending => "pending",
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Idle
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the simulated call stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStackFrame {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub executed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<u64>,
    /// Free-form execution context supplied by the caller.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub return_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl CallStackFrame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            created_at: 0,
            executed_at: None,
            completed_at: None,
            context: None,
            return_value: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_created_at(mut self, at_ms: u64) -> Self {
        self.created_at = at_ms;
        self
    }

    pub(crate) fn mark_completed(&mut self, now_ms: u64) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now_ms);
    }
}

/// A queued microtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrotaskItem {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    pub source: MicrotaskSource,
    #[serde(default)]
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub executed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<Value>,
}

impl MicrotaskItem {
    pub fn new(name: impl Into<String>, source: MicrotaskSource) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            source,
            created_at: 0,
            executed_at: None,
            completed_at: None,
            context: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_created_at(mut self, at_ms: u64) -> Self {
        self.created_at = at_ms;
        self
    }

    pub(crate) fn mark_executed(&mut self, now_ms: u64) {
        self.status = TaskStatus::Completed;
        self.executed_at = Some(now_ms);
        self.completed_at = Some(now_ms);
    }
}

/// A time-scheduled macrotask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacrotaskItem {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    pub source: MacrotaskSource,
    /// Requested delay in simulated milliseconds.
    #[serde(default)]
    pub delay: u64,
    /// Absolute due time. Filled in at enqueue as `now + delay` when unset.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scheduled_at: Option<u64>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub executed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<Value>,
}

impl MacrotaskItem {
    pub fn new(name: impl Into<String>, source: MacrotaskSource) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            source,
            delay: 0,
            scheduled_at: None,
            created_at: 0,
            executed_at: None,
            completed_at: None,
            context: None,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_scheduled_at(mut self, at_ms: u64) -> Self {
        self.scheduled_at = Some(at_ms);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_created_at(mut self, at_ms: u64) -> Self {
        self.created_at = at_ms;
        self
    }

    pub(crate) fn mark_executed(&mut self, now_ms: u64) {
        self.status = TaskStatus::Completed;
        self.executed_at = Some(now_ms);
        self.completed_at = Some(now_ms);
    }
}
