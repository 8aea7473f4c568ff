//! The queue system: one call stack, one microtask queue, one macrotask
//! queue, managed together with snapshot/restore and debug introspection.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::clock::epoch_millis;
use crate::queue::{BoundedQueue, CallStack, MacrotaskQueue, MicrotaskQueue};
use crate::task::{CallStackFrame, MacrotaskItem, MicrotaskItem};

/// How many items of each queue a debug summary prints before truncating.
const DEBUG_ITEM_LIMIT: usize = 3;

/// The three queues of one scheduler instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSystem {
    call_stack: CallStack,
    microtasks: MicrotaskQueue,
    macrotasks: MacrotaskQueue,
}

/// Aggregate counts captured alongside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub call_stack_size: usize,
    pub microtask_count: usize,
    pub macrotask_count: usize,
    pub total: usize,
}

/// Full serializable capture of the queue system at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Wall-clock stamp of when the snapshot was taken, epoch milliseconds.
    pub timestamp: u64,
    pub call_stack: Vec<CallStackFrame>,
    pub microtasks: Vec<MicrotaskItem>,
    pub macrotasks: Vec<MacrotaskItem>,
    pub counts: QueueCounts,
}

impl QueueSystem {
    pub fn new(max_call_stack: usize, max_microtasks: usize, max_macrotasks: usize) -> Self {
        Self {
            call_stack: CallStack::new(max_call_stack),
            microtasks: MicrotaskQueue::new(max_microtasks),
            macrotasks: MacrotaskQueue::new(max_macrotasks),
        }
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    pub fn call_stack_mut(&mut self) -> &mut CallStack {
        &mut self.call_stack
    }

    pub fn microtasks(&self) -> &MicrotaskQueue {
        &self.microtasks
    }

    pub fn microtasks_mut(&mut self) -> &mut MicrotaskQueue {
        &mut self.microtasks
    }

    pub fn macrotasks(&self) -> &MacrotaskQueue {
        &self.macrotasks
    }

    pub fn macrotasks_mut(&mut self) -> &mut MacrotaskQueue {
        &mut self.macrotasks
    }

    /// Total items across all three queues.
    pub fn total_len(&self) -> usize {
        self.call_stack.len() + self.microtasks.len() + self.macrotasks.len()
    }

    /// True when the call stack and both task queues hold nothing.
    pub fn all_empty(&self) -> bool {
        self.call_stack.is_empty() && self.microtasks.is_empty() && self.macrotasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.call_stack.clear();
        self.microtasks.clear();
        self.macrotasks.clear();
    }

    /// Captures every queue's contents plus aggregate counts.
    pub fn snapshot(&self) -> QueueSnapshot {
        let counts = QueueCounts {
            call_stack_size: self.call_stack.len(),
            microtask_count: self.microtasks.len(),
            macrotask_count: self.macrotasks.len(),
            total: self.total_len(),
        };
        QueueSnapshot {
            timestamp: epoch_millis(),
            call_stack: self.call_stack.frames().to_vec(),
            microtasks: self.microtasks.iter().cloned().collect(),
            macrotasks: self.macrotasks.iter().cloned().collect(),
            counts,
        }
    }

    /// Replaces every queue's contents with the snapshot's. Capacities stay
    /// as configured on this system; a snapshot taken under larger limits
    /// restores as-is and later enqueues enforce the current limits.
    pub fn restore_from_snapshot(&mut self, snapshot: QueueSnapshot) {
        self.call_stack.replace_frames(snapshot.call_stack);
        self.microtasks.replace_items(snapshot.microtasks);
        self.macrotasks.replace_items(snapshot.macrotasks);
    }

    /// Human-readable multi-line summary, truncated per queue.
    pub fn debug_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "call stack ({}/{}):",
            self.call_stack.len(),
            self.call_stack.capacity()
        );
        Self::write_section(
            &mut out,
            self.call_stack
                .frames()
                .iter()
                .rev()
                .map(|frame| format!("{} ({})", frame.name, frame.status)),
            self.call_stack.len(),
        );

        let _ = writeln!(
            out,
            "microtask queue ({}/{}):",
            self.microtasks.len(),
            self.microtasks.capacity()
        );
        Self::write_section(
            &mut out,
            self.microtasks
                .iter()
                .map(|item| format!("{} [{}, {}]", item.name, item.source, item.priority)),
            self.microtasks.len(),
        );

        let _ = writeln!(
            out,
            "macrotask queue ({}/{}):",
            self.macrotasks.len(),
            self.macrotasks.capacity()
        );
        Self::write_section(
            &mut out,
            self.macrotasks.iter().map(|item| {
                format!(
                    "{} [{}, due {}]",
                    item.name,
                    item.source,
                    item.scheduled_at
                        .map_or_else(|| "unset".to_string(), |at| at.to_string())
                )
            }),
            self.macrotasks.len(),
        );
        out
    }

    fn write_section(out: &mut String, lines: impl Iterator<Item = String>, total: usize) {
        if total == 0 {
            let _ = writeln!(out, "  (empty)");
            return;
        }
        for line in lines.take(DEBUG_ITEM_LIMIT) {
            let _ = writeln!(out, "  - {line}");
        }
        if total > DEBUG_ITEM_LIMIT {
            let _ = writeln!(out, "  ...and {} more", total - DEBUG_ITEM_LIMIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_fixtures::{frame, microtask, timeout};
    use crate::task::MicrotaskSource;

    fn populated_system() -> QueueSystem {
        let mut system = QueueSystem::new(10, 10, 10);
        system
            .call_stack_mut()
            .push(frame("main"))
            .expect("push should succeed");
        system
            .microtasks_mut()
            .enqueue(microtask("cb", MicrotaskSource::QueueMicrotask))
            .expect("enqueue should succeed");
        system
            .macrotasks_mut()
            .enqueue_at(timeout("timer", 100), 0)
            .expect("enqueue should succeed");
        system
    }

    #[test]
    fn snapshot_captures_contents_and_counts() {
        let system = populated_system();
        let snapshot = system.snapshot();
        assert_eq!(snapshot.call_stack.len(), 1);
        assert_eq!(snapshot.microtasks.len(), 1);
        assert_eq!(snapshot.macrotasks.len(), 1);
        assert_eq!(snapshot.counts.total, 3);
        assert!(snapshot.timestamp > 0);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = populated_system().snapshot();
        let json = serde_json::to_string(&snapshot).expect("serialize should succeed");
        let back: QueueSnapshot = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(back, snapshot);
    }

    #[test]
    fn restore_replaces_contents() {
        let snapshot = populated_system().snapshot();
        let mut empty = QueueSystem::new(10, 10, 10);
        empty.restore_from_snapshot(snapshot);
        assert_eq!(empty.total_len(), 3);
        assert!(empty.call_stack().contains("main"));
        assert_eq!(
            empty.macrotasks().peek().map(|item| item.name.as_str()),
            Some("timer")
        );
    }

    #[test]
    fn restore_keeps_current_capacity_enforcement() {
        let snapshot = populated_system().snapshot();
        let mut tiny = QueueSystem::new(1, 1, 1);
        tiny.restore_from_snapshot(snapshot);
        assert_eq!(tiny.call_stack().len(), 1);
        let err = tiny
            .call_stack_mut()
            .push(frame("extra"))
            .expect_err("stack should be at capacity");
        assert!(err.to_string().contains("Maximum call stack size exceeded"));
    }

    #[test]
    fn all_empty_reflects_queue_state() {
        let mut system = populated_system();
        assert!(!system.all_empty());
        system.clear();
        assert!(system.all_empty());
    }

    #[test]
    fn debug_info_truncates_long_queues() {
        let mut system = QueueSystem::new(10, 10, 10);
        for i in 0..5 {
            system
                .microtasks_mut()
                .enqueue(microtask(&format!("task-{i}"), MicrotaskSource::QueueMicrotask))
                .expect("enqueue should succeed");
        }
        let info = system.debug_info();
        assert!(info.contains("microtask queue (5/10):"));
        assert!(info.contains("...and 2 more"));
        assert!(info.contains("(empty)"));
    }

    #[test]
    fn debug_info_lists_stack_most_recent_first() {
        let mut system = QueueSystem::new(10, 10, 10);
        system
            .call_stack_mut()
            .push(frame("outer"))
            .expect("push should succeed");
        system
            .call_stack_mut()
            .push(frame("inner"))
            .expect("push should succeed");
        let info = system.debug_info();
        let inner_at = info.find("inner").expect("inner should be listed");
        let outer_at = info.find("outer").expect("outer should be listed");
        assert!(inner_at < outer_at);
    }
}
