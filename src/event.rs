//! Event encoding, decoding, and shared types for the event-sourced
//! scheduler.
//!
//! This module provides the typed domain events and the pure conversion
//! functions between them and the store's generic record format. The store
//! and the sourced scheduler both depend on it; no state lives here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::SchedulerConfig;
use crate::task::{CallStackFrame, MacrotaskItem, MicrotaskItem, Phase, TaskId};

/// Aggregate type stamped on every scheduler event record.
pub const AGGREGATE_TYPE: &str = "scheduler";

/// Optional provenance metadata stamped on event records.
///
/// All fields are optional; absent fields are omitted from the serialized
/// form so records stay compact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Session that produced the event, if the scheduler was tagged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Free-form origin marker (e.g. "engine", "dispatcher").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// ID of the command or event that caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Correlation ID threaded through a whole interaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventMetadata {
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// An event record as held by the store.
///
/// The `payload` is kept as raw JSON so the store never needs to know the
/// domain event vocabulary; [`decode_scheduler_event`] recovers the typed
/// form when one side cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Client-assigned event ID (UUID v4).
    pub id: Uuid,
    /// Event type tag (e.g. "MICROTASK_ENQUEUED").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Stream the event belongs to.
    pub aggregate_id: String,
    /// Aggregate type, always [`AGGREGATE_TYPE`] for scheduler streams.
    pub aggregate_type: String,
    /// One-based, strictly sequential position within the stream.
    pub version: u64,
    /// Wall-clock timestamp in Unix epoch milliseconds.
    pub timestamp: u64,
    /// Typed payload serialized to JSON; null for payload-free events.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

/// Everything that can happen to a scheduler, as recorded facts.
///
/// Queue items and frames are carried fully normalized: priorities are
/// already coerced and `scheduledAt` already resolved at recording time, so
/// applying an event never consults a clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum SchedulerEvent {
    /// First event of every stream; fixes the capacities.
    EngineConfigured { config: SchedulerConfig },
    FunctionPushed { frame: CallStackFrame },
    /// Carries the completed frame as it left the stack.
    FunctionPopped { frame: CallStackFrame },
    MicrotaskEnqueued { task: MicrotaskItem },
    MicrotaskDequeued { task_id: TaskId },
    MicrotaskExecuted { task: MicrotaskItem },
    MacrotaskEnqueued { task: MacrotaskItem },
    MacrotaskDequeued { task_id: TaskId },
    MacrotaskExecuted { task: MacrotaskItem },
    TickStarted { tick: u64 },
    TickCompleted {
        tick: u64,
        microtasks_processed: usize,
        macrotasks_processed: usize,
    },
    PhaseChanged { phase: Phase },
    EngineReset,
    /// A failed operation, recorded for the audit trail. Applying it
    /// changes nothing.
    ExecutionError { operation: String, reason: String },
}

impl SchedulerEvent {
    /// The wire tag of this event, without serializing it.
    pub fn event_type(&self) -> &'static str {
        match self {
            SchedulerEvent::EngineConfigured { .. } => "ENGINE_CONFIGURED",
            SchedulerEvent::FunctionPushed { .. } => "FUNCTION_PUSHED",
            SchedulerEvent::FunctionPopped { .. } => "FUNCTION_POPPED",
            SchedulerEvent::MicrotaskEnqueued { .. } => "MICROTASK_ENQUEUED",
            SchedulerEvent::MicrotaskDequeued { .. } => "MICROTASK_DEQUEUED",
            SchedulerEvent::MicrotaskExecuted { .. } => "MICROTASK_EXECUTED",
            SchedulerEvent::MacrotaskEnqueued { .. } => "MACROTASK_ENQUEUED",
            SchedulerEvent::MacrotaskDequeued { .. } => "MACROTASK_DEQUEUED",
            SchedulerEvent::MacrotaskExecuted { .. } => "MACROTASK_EXECUTED",
            SchedulerEvent::TickStarted { .. } => "TICK_STARTED",
            SchedulerEvent::TickCompleted { .. } => "TICK_COMPLETED",
            SchedulerEvent::PhaseChanged { .. } => "PHASE_CHANGED",
            SchedulerEvent::EngineReset => "ENGINE_RESET",
            SchedulerEvent::ExecutionError { .. } => "EXECUTION_ERROR",
        }
    }
}

/// Encode a typed scheduler event into a [`DomainEvent`] record.
///
/// Serializes the adjacently-tagged event (`#[serde(tag = "type", content =
/// "payload")]`), splits the `"type"` and `"payload"` fields into the
/// record's columns, and stamps a fresh UUID v4 event ID.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized to JSON.
pub fn encode_scheduler_event(
    event: &SchedulerEvent,
    aggregate_id: &str,
    version: u64,
    timestamp: u64,
    metadata: Option<EventMetadata>,
) -> serde_json::Result<DomainEvent> {
    // Serialization produces JSON like:
    //   {"type": "ENGINE_RESET"}                       (unit variant)
    //   {"type": "TICK_STARTED", "payload": {...}}     (variant with fields)
    let value = serde_json::to_value(event)?;
    let obj = value
        .as_object()
        .expect("adjacently tagged enum must serialize to a JSON object");

    let event_type = obj["type"]
        .as_str()
        .expect("adjacently tagged enum must have a string 'type' field")
        .to_string();

    // Unit variants carry no "payload" key; store null instead.
    let payload = obj
        .get("payload")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    Ok(DomainEvent {
        id: Uuid::new_v4(),
        event_type,
        aggregate_id: aggregate_id.to_string(),
        aggregate_type: AGGREGATE_TYPE.to_string(),
        version,
        timestamp,
        payload,
        metadata,
    })
}

/// Decode a stored [`DomainEvent`] back into a typed [`SchedulerEvent`].
///
/// Rejoins the record's type tag and payload into the adjacently-tagged
/// form and deserializes it. Returns `None` if:
///
/// - The type tag is not a known scheduler event.
/// - The payload does not match the shape the tag requires.
///
/// Records written by other producers into the same store are skipped this
/// way rather than failing a replay.
pub fn decode_scheduler_event(event: &DomainEvent) -> Option<SchedulerEvent> {
    let mut obj = serde_json::Map::new();
    obj.insert(
        "type".to_string(),
        serde_json::Value::String(event.event_type.clone()),
    );
    if !event.payload.is_null() {
        obj.insert("payload".to_string(), event.payload.clone());
    }
    serde_json::from_value(serde_json::Value::Object(obj)).ok()
}
