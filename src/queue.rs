//! Queue primitives: a bounded LIFO call stack, a priority-ordered
//! microtask queue, and a time-scheduled macrotask queue.
//!
//! All three share the [`BoundedQueue`] contract; each adds the queries its
//! scheduling role needs. Ordering invariants live here, not in the engine:
//! the microtask queue is priority-major / insertion-minor, the macrotask
//! queue is due-time-major with earlier-due items in front.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::task::{
    CallStackFrame, MacrotaskItem, MacrotaskSource, MicrotaskItem, MicrotaskSource, Priority,
};

/// Which of the three queues an error or debug line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueKind {
    CallStack,
    Microtask,
    Macrotask,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            QueueKind::CallStack => "call stack",
            QueueKind::Microtask => "microtask",
            QueueKind::Macrotask => "macrotask",
        })
    }
}

/// Contract shared by every bounded queue in the system.
///
/// `enqueue` fails with a capacity error at `capacity()`; `dequeue` returns
/// the next item under the queue's own discipline (LIFO for the call stack,
/// priority order for microtasks, due-time order for macrotasks) and `None`
/// when empty, never an error.
pub trait BoundedQueue {
    type Item;

    fn enqueue(&mut self, item: Self::Item) -> Result<(), EngineError>;
    fn dequeue(&mut self) -> Option<Self::Item>;
    fn peek(&self) -> Option<&Self::Item>;
    fn clear(&mut self);
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}

/// LIFO stack of active function frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStack {
    frames: Vec<CallStackFrame>,
    #[serde(rename = "maxSize")]
    capacity: usize,
}

impl CallStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::new(),
            capacity,
        }
    }

    /// Pushes a frame, failing with a stack-overflow error at capacity.
    pub fn push(&mut self, frame: CallStackFrame) -> Result<(), EngineError> {
        if self.frames.len() >= self.capacity {
            return Err(EngineError::StackOverflow {
                capacity: self.capacity,
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Removes and returns the top frame; `None` on an empty stack.
    pub fn pop(&mut self) -> Option<CallStackFrame> {
        self.frames.pop()
    }

    /// The top (last-pushed) frame.
    pub fn peek(&self) -> Option<&CallStackFrame> {
        self.frames.last()
    }

    /// Frames in push order, bottom first.
    pub fn frames(&self) -> &[CallStackFrame] {
        &self.frames
    }

    /// Frame names, most recent call first.
    pub fn stack_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| frame.name.clone())
            .collect()
    }

    /// True if any frame carries the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.frames.iter().any(|frame| frame.name == name)
    }

    /// Number of frames sharing `name`, i.e. the current recursion depth of
    /// that function.
    pub fn recursion_depth(&self, name: &str) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.name == name)
            .count()
    }

    /// Wholesale replacement used by snapshot restore; skips the capacity
    /// check so a foreign snapshot loads as-is.
    pub(crate) fn replace_frames(&mut self, frames: Vec<CallStackFrame>) {
        self.frames = frames;
    }
}

impl BoundedQueue for CallStack {
    type Item = CallStackFrame;

    fn enqueue(&mut self, item: CallStackFrame) -> Result<(), EngineError> {
        self.push(item)
    }

    fn dequeue(&mut self) -> Option<CallStackFrame> {
        self.pop()
    }

    fn peek(&self) -> Option<&CallStackFrame> {
        CallStack::peek(self)
    }

    fn clear(&mut self) {
        self.frames.clear();
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Priority-ordered queue of microtasks.
///
/// Insertion keeps the queue priority-major and insertion-minor: a new item
/// lands before the first existing item of strictly lower urgency and after
/// every item of equal urgency. Promise-sourced items are always stored at
/// high priority, whatever the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrotaskQueue {
    items: VecDeque<MicrotaskItem>,
    #[serde(rename = "maxSize")]
    capacity: usize,
}

impl MicrotaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MicrotaskItem> {
        self.items.iter()
    }

    /// All items originating from `source`, in queue order.
    pub fn by_source(&self, source: MicrotaskSource) -> Vec<&MicrotaskItem> {
        self.items
            .iter()
            .filter(|item| item.source == source)
            .collect()
    }

    /// Removes and returns every promise-sourced item, leaving the rest in
    /// their original relative order.
    pub fn drain_promises(&mut self) -> Vec<MicrotaskItem> {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        while let Some(item) = self.items.pop_front() {
            if item.source == MicrotaskSource::Promise {
                drained.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        drained
    }

    pub(crate) fn replace_items(&mut self, items: Vec<MicrotaskItem>) {
        self.items = items.into();
    }
}

impl BoundedQueue for MicrotaskQueue {
    type Item = MicrotaskItem;

    fn enqueue(&mut self, mut item: MicrotaskItem) -> Result<(), EngineError> {
        if self.items.len() >= self.capacity {
            return Err(EngineError::QueueFull {
                queue: QueueKind::Microtask,
                capacity: self.capacity,
            });
        }
        if item.source == MicrotaskSource::Promise {
            item.priority = Priority::High;
        }
        let position = self
            .items
            .iter()
            .position(|existing| existing.priority > item.priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, item);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<MicrotaskItem> {
        self.items.pop_front()
    }

    fn peek(&self) -> Option<&MicrotaskItem> {
        self.items.front()
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Time-scheduled queue of macrotasks, ordered by absolute due time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacrotaskQueue {
    items: VecDeque<MacrotaskItem>,
    #[serde(rename = "maxSize")]
    capacity: usize,
}

impl MacrotaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueues an item against the given clock reading. When the item has
    /// no `scheduled_at`, it is computed as `now_ms + delay`. The item lands
    /// in front of the first existing item due at the same time or later, so
    /// an undelayed item overtakes anything merely due now.
    pub fn enqueue_at(&mut self, mut item: MacrotaskItem, now_ms: u64) -> Result<(), EngineError> {
        if self.items.len() >= self.capacity {
            return Err(EngineError::QueueFull {
                queue: QueueKind::Macrotask,
                capacity: self.capacity,
            });
        }
        let due = item
            .scheduled_at
            .unwrap_or_else(|| now_ms.saturating_add(item.delay));
        item.scheduled_at = Some(due);
        let position = self
            .items
            .iter()
            .position(|existing| existing.scheduled_at.unwrap_or(0) >= due)
            .unwrap_or(self.items.len());
        self.items.insert(position, item);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacrotaskItem> {
        self.items.iter()
    }

    /// Items already due at `now_ms`, in queue order.
    pub fn ready_tasks(&self, now_ms: u64) -> Vec<&MacrotaskItem> {
        self.items
            .iter()
            .filter(|item| item.scheduled_at.unwrap_or(0) <= now_ms)
            .collect()
    }

    /// Removes and returns the first item due at `now_ms`, if any.
    pub fn dequeue_ready(&mut self, now_ms: u64) -> Option<MacrotaskItem> {
        let position = self
            .items
            .iter()
            .position(|item| item.scheduled_at.unwrap_or(0) <= now_ms)?;
        self.items.remove(position)
    }

    /// Removes and returns every item originating from `source`, leaving the
    /// rest in their original relative order.
    pub fn cancel_by_source(&mut self, source: MacrotaskSource) -> Vec<MacrotaskItem> {
        let mut cancelled = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        while let Some(item) = self.items.pop_front() {
            if item.source == source {
                cancelled.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        cancelled
    }

    /// Earliest due time still in the future relative to `now_ms`.
    pub fn next_scheduled_time(&self, now_ms: u64) -> Option<u64> {
        self.items
            .iter()
            .filter_map(|item| item.scheduled_at)
            .filter(|&at| at > now_ms)
            .min()
    }

    pub(crate) fn replace_items(&mut self, items: Vec<MacrotaskItem>) {
        self.items = items.into();
    }
}

impl BoundedQueue for MacrotaskQueue {
    type Item = MacrotaskItem;

    /// Enqueue with no clock baseline: an item without `scheduled_at` is
    /// positioned relative to time zero. Engine code always goes through
    /// [`MacrotaskQueue::enqueue_at`] with its own clock.
    fn enqueue(&mut self, item: MacrotaskItem) -> Result<(), EngineError> {
        self.enqueue_at(item, 0)
    }

    fn dequeue(&mut self) -> Option<MacrotaskItem> {
        self.items.pop_front()
    }

    fn peek(&self) -> Option<&MacrotaskItem> {
        self.items.front()
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_fixtures::{frame, microtask, timeout};

    #[test]
    fn pops_return_frames_in_reverse_push_order() {
        let mut stack = CallStack::new(10);
        for name in ["a", "b", "c"] {
            stack.push(frame(name)).expect("push should succeed");
        }
        let popped: Vec<String> = std::iter::from_fn(|| stack.pop())
            .map(|f| f.name)
            .collect();
        assert_eq!(popped, vec!["c", "b", "a"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn push_past_capacity_overflows() {
        let mut stack = CallStack::new(2);
        stack.push(frame("a")).expect("push should succeed");
        stack.push(frame("b")).expect("push should succeed");
        let err = stack.push(frame("c")).expect_err("third push should fail");
        assert_eq!(err, EngineError::StackOverflow { capacity: 2 });
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let mut stack = CallStack::new(4);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn stack_trace_is_most_recent_first() {
        let mut stack = CallStack::new(10);
        stack.push(frame("main")).expect("push should succeed");
        stack.push(frame("outer")).expect("push should succeed");
        stack.push(frame("inner")).expect("push should succeed");
        assert_eq!(stack.stack_trace(), vec!["inner", "outer", "main"]);
    }

    #[test]
    fn recursion_depth_counts_same_named_frames() {
        let mut stack = CallStack::new(10);
        for _ in 0..3 {
            stack.push(frame("fib")).expect("push should succeed");
        }
        stack.push(frame("main")).expect("push should succeed");
        assert_eq!(stack.recursion_depth("fib"), 3);
        assert_eq!(stack.recursion_depth("missing"), 0);
        assert!(stack.contains("main"));
    }

    #[test]
    fn promise_source_forces_high_priority() {
        let mut queue = MicrotaskQueue::new(10);
        let item = microtask("then", MicrotaskSource::Promise).with_priority(Priority::Low);
        queue.enqueue(item).expect("enqueue should succeed");
        let stored = queue.peek().expect("queue should have an item");
        assert_eq!(stored.priority, Priority::High);
    }

    #[test]
    fn microtasks_order_priority_major_insertion_minor() {
        let mut queue = MicrotaskQueue::new(10);
        let items = [
            microtask("low", MicrotaskSource::QueueMicrotask).with_priority(Priority::Low),
            microtask("normal-1", MicrotaskSource::QueueMicrotask).with_priority(Priority::Normal),
            microtask("immediate", MicrotaskSource::QueueMicrotask)
                .with_priority(Priority::Immediate),
            microtask("normal-2", MicrotaskSource::QueueMicrotask).with_priority(Priority::Normal),
        ];
        for item in items {
            queue.enqueue(item).expect("enqueue should succeed");
        }
        let order: Vec<&str> = queue.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(order, vec!["immediate", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn microtask_queue_rejects_when_full() {
        let mut queue = MicrotaskQueue::new(1);
        queue
            .enqueue(microtask("one", MicrotaskSource::QueueMicrotask))
            .expect("enqueue should succeed");
        let err = queue
            .enqueue(microtask("two", MicrotaskSource::QueueMicrotask))
            .expect_err("second enqueue should fail");
        assert_eq!(
            err,
            EngineError::QueueFull {
                queue: QueueKind::Microtask,
                capacity: 1,
            }
        );
    }

    #[test]
    fn drain_promises_keeps_other_sources_in_order() {
        let mut queue = MicrotaskQueue::new(10);
        queue
            .enqueue(microtask("p1", MicrotaskSource::Promise))
            .expect("enqueue should succeed");
        queue
            .enqueue(microtask("observer", MicrotaskSource::MutationObserver))
            .expect("enqueue should succeed");
        queue
            .enqueue(microtask("p2", MicrotaskSource::Promise))
            .expect("enqueue should succeed");
        queue
            .enqueue(microtask("plain", MicrotaskSource::QueueMicrotask))
            .expect("enqueue should succeed");

        let drained = queue.drain_promises();
        let drained_names: Vec<&str> = drained.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(drained_names, vec!["p1", "p2"]);
        let remaining: Vec<&str> = queue.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(remaining, vec!["observer", "plain"]);
    }

    #[test]
    fn by_source_filters_in_queue_order() {
        let mut queue = MicrotaskQueue::new(10);
        queue
            .enqueue(microtask("a", MicrotaskSource::QueueMicrotask))
            .expect("enqueue should succeed");
        queue
            .enqueue(microtask("b", MicrotaskSource::MutationObserver))
            .expect("enqueue should succeed");
        queue
            .enqueue(microtask("c", MicrotaskSource::QueueMicrotask))
            .expect("enqueue should succeed");
        let names: Vec<&str> = queue
            .by_source(MicrotaskSource::QueueMicrotask)
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn macrotasks_order_by_due_time() {
        let mut queue = MacrotaskQueue::new(10);
        queue
            .enqueue_at(timeout("late", 300), 0)
            .expect("enqueue should succeed");
        queue
            .enqueue_at(timeout("middle", 100), 0)
            .expect("enqueue should succeed");
        queue
            .enqueue_at(timeout("now", 0), 0)
            .expect("enqueue should succeed");
        let order: Vec<&str> = queue.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(order, vec!["now", "middle", "late"]);
    }

    #[test]
    fn undelayed_item_lands_before_an_equal_due_time() {
        let mut queue = MacrotaskQueue::new(10);
        // Due at 100 because of its delay.
        queue
            .enqueue_at(timeout("delayed", 100), 0)
            .expect("enqueue should succeed");
        // Due at 100 because the clock has reached 100.
        queue
            .enqueue_at(timeout("fresh", 0), 100)
            .expect("enqueue should succeed");
        let order: Vec<&str> = queue.iter().map(|item| item.name.as_str()).collect();
        assert_eq!(order, vec!["fresh", "delayed"]);
    }

    #[test]
    fn explicit_scheduled_at_is_respected() {
        let mut queue = MacrotaskQueue::new(10);
        let item = timeout("pinned", 500).with_scheduled_at(42);
        queue.enqueue_at(item, 1000).expect("enqueue should succeed");
        let stored = queue.peek().expect("queue should have an item");
        assert_eq!(stored.scheduled_at, Some(42));
    }

    #[test]
    fn ready_tasks_respect_the_clock() {
        let mut queue = MacrotaskQueue::new(10);
        queue
            .enqueue_at(timeout("soon", 50), 0)
            .expect("enqueue should succeed");
        queue
            .enqueue_at(timeout("later", 200), 0)
            .expect("enqueue should succeed");
        assert!(queue.ready_tasks(0).is_empty());
        assert_eq!(queue.ready_tasks(50).len(), 1);
        assert_eq!(queue.ready_tasks(500).len(), 2);
    }

    #[test]
    fn dequeue_ready_takes_first_due_item_only() {
        let mut queue = MacrotaskQueue::new(10);
        queue
            .enqueue_at(timeout("first", 0), 0)
            .expect("enqueue should succeed");
        queue
            .enqueue_at(timeout("second", 0), 0)
            .expect("enqueue should succeed");
        let taken = queue.dequeue_ready(0).expect("an item should be ready");
        assert_eq!(taken.name, "second");
        assert_eq!(queue.len(), 1);
        assert!(queue.dequeue_ready(0).is_some());
        assert!(queue.dequeue_ready(0).is_none());
    }

    #[test]
    fn dequeue_ready_returns_none_when_nothing_is_due() {
        let mut queue = MacrotaskQueue::new(10);
        queue
            .enqueue_at(timeout("later", 500), 0)
            .expect("enqueue should succeed");
        assert!(queue.dequeue_ready(499).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_by_source_removes_matching_items() {
        let mut queue = MacrotaskQueue::new(10);
        queue
            .enqueue_at(timeout("t1", 10), 0)
            .expect("enqueue should succeed");
        queue
            .enqueue_at(
                MacrotaskItem::new("io", MacrotaskSource::Io).with_delay(20),
                0,
            )
            .expect("enqueue should succeed");
        queue
            .enqueue_at(timeout("t2", 30), 0)
            .expect("enqueue should succeed");

        let cancelled = queue.cancel_by_source(MacrotaskSource::SetTimeout);
        assert_eq!(cancelled.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.peek().map(|item| item.source),
            Some(MacrotaskSource::Io)
        );
    }

    #[test]
    fn next_scheduled_time_skips_past_due_items() {
        let mut queue = MacrotaskQueue::new(10);
        queue
            .enqueue_at(timeout("due", 0), 0)
            .expect("enqueue should succeed");
        queue
            .enqueue_at(timeout("future", 250), 0)
            .expect("enqueue should succeed");
        assert_eq!(queue.next_scheduled_time(0), Some(250));
        assert_eq!(queue.next_scheduled_time(250), None);
    }

    #[test]
    fn macrotask_queue_rejects_when_full() {
        let mut queue = MacrotaskQueue::new(1);
        queue
            .enqueue_at(timeout("one", 0), 0)
            .expect("enqueue should succeed");
        let err = queue
            .enqueue_at(timeout("two", 0), 0)
            .expect_err("second enqueue should fail");
        assert_eq!(
            err,
            EngineError::QueueFull {
                queue: QueueKind::Macrotask,
                capacity: 1,
            }
        );
    }
}
