//! Crate-level error types for the engine, event store, replay, and dispatch.

use crate::queue::QueueKind;

/// Operational failure inside an engine mutation.
///
/// Engine mutators never return these as `Err`; they are embedded in the
/// failure result the caller inspects. Several `Display` strings are
/// contract surface that downstream code matches on, so they are pinned by
/// tests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Push attempted on a call stack already at capacity.
    #[error("Maximum call stack size exceeded (capacity {capacity})")]
    StackOverflow { capacity: usize },

    /// Pop attempted on an empty call stack.
    #[error("Call stack is empty")]
    StackEmpty,

    /// Enqueue attempted on a task queue already at capacity.
    #[error("{queue} queue is full (capacity {capacity})")]
    QueueFull { queue: QueueKind, capacity: usize },

    /// Any other failure caught during a mutating operation.
    #[error("execution failure in {operation}: {reason}")]
    Execution { operation: String, reason: String },
}

/// Append-time failure from the event store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStoreError {
    /// Optimistic concurrency check failed.
    ///
    /// The caller's expected version did not match the stream head. This is
    /// the one error the event-sourced scheduler re-throws to its caller
    /// instead of converting into a failure result.
    #[error("concurrency conflict on stream '{stream_id}': expected version {expected}, found {actual}")]
    VersionConflict {
        stream_id: String,
        expected: u64,
        actual: u64,
    },

    /// A supplied event broke the strictly sequential version numbering.
    #[error("out-of-sequence event on stream '{stream_id}': expected version {expected}, found {found}")]
    OutOfSequence {
        stream_id: String,
        expected: u64,
        found: u64,
    },

    /// An event payload could not be serialized for storage.
    #[error("failed to encode event: {0}")]
    Encoding(String),
}

impl EventStoreError {
    /// True for the optimistic-concurrency conflict case.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::VersionConflict { .. })
    }
}

/// Failure reconstructing historical state from the event log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// Requested version lies outside `0..=current`.
    #[error("replay version {requested} is out of range 0..={current}")]
    VersionOutOfRange { requested: u64, current: u64 },

    /// The throwaway replay scheduler could not be constructed.
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Structural failure in the command/query dispatch pipeline.
///
/// Dispatchers throw these (return them as `Err`) rather than converting
/// them into failure results; operational failures inside a handler stay in
/// the result object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Command failed shape validation before any handler ran.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Query failed shape validation before any handler ran.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// No handler registered for the command's type tag.
    #[error("No handler found for command type: {0}")]
    NoCommandHandler(String),

    /// No handler registered for the query's type tag.
    #[error("No handler found for query type: {0}")]
    NoQueryHandler(String),

    /// Store failure surfaced through a handler, forwarded unchanged so the
    /// concurrency carve-out stays visible to the dispatching caller.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Replay failure surfaced through a query handler.
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// Best-effort extraction of a message from a caught panic payload.
pub(crate) fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_reason_reads_string_payloads() {
        let reason = panic_reason(Box::new("boom"));
        assert_eq!(reason, "boom");
        let reason = panic_reason(Box::new(String::from("dynamic boom")));
        assert_eq!(reason, "dynamic boom");
        let reason = panic_reason(Box::new(42_u32));
        assert_eq!(reason, "panic with non-string payload");
    }

    #[test]
    fn stack_empty_message_is_stable() {
        assert_eq!(EngineError::StackEmpty.to_string(), "Call stack is empty");
    }

    #[test]
    fn stack_overflow_message_names_the_limit() {
        let err = EngineError::StackOverflow { capacity: 10 };
        assert_eq!(
            err.to_string(),
            "Maximum call stack size exceeded (capacity 10)"
        );
    }

    #[test]
    fn queue_full_message_names_the_queue() {
        let err = EngineError::QueueFull {
            queue: QueueKind::Microtask,
            capacity: 8,
        };
        assert_eq!(err.to_string(), "microtask queue is full (capacity 8)");
    }

    #[test]
    fn conflict_message_carries_versions() {
        let err = EventStoreError::VersionConflict {
            stream_id: "scheduler-1".into(),
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "concurrency conflict on stream 'scheduler-1': expected version 3, found 5"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn out_of_sequence_is_not_a_conflict() {
        let err = EventStoreError::OutOfSequence {
            stream_id: "scheduler-1".into(),
            expected: 4,
            found: 6,
        };
        assert!(!err.is_conflict());
    }

    #[test]
    fn replay_out_of_range_display() {
        let err = ReplayError::VersionOutOfRange {
            requested: 9,
            current: 4,
        };
        assert_eq!(err.to_string(), "replay version 9 is out of range 0..=4");
    }

    #[test]
    fn dispatch_messages_match_the_contract() {
        assert_eq!(
            DispatchError::InvalidCommand("TICK".into()).to_string(),
            "Invalid command: TICK"
        );
        assert_eq!(
            DispatchError::NoCommandHandler("TICK".into()).to_string(),
            "No handler found for command type: TICK"
        );
        assert_eq!(
            DispatchError::NoQueryHandler("GET_CURRENT_STATE".into()).to_string(),
            "No handler found for query type: GET_CURRENT_STATE"
        );
    }

    #[test]
    fn store_errors_pass_through_dispatch_transparently() {
        let inner = EventStoreError::VersionConflict {
            stream_id: "s".into(),
            expected: 1,
            actual: 2,
        };
        let wrapped = DispatchError::from(inner.clone());
        assert_eq!(wrapped.to_string(), inner.to_string());
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries in async callers.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<EngineError>();
            assert_send_sync::<EventStoreError>();
            assert_send_sync::<ReplayError>();
            assert_send_sync::<DispatchError>();
        }
    };
}
