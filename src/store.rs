//! Append-only in-memory event store with optimistic concurrency control.
//!
//! Events live in a single global log in arrival order; per-stream version
//! counters enforce that appends are strictly sequential within a stream.
//! Readers get clones, so nothing handed out can mutate the log. Listeners
//! registered through [`EventStore::subscribe`] are notified after each
//! append commits.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::clock::epoch_millis;
use crate::error::{EventStoreError, panic_reason};
use crate::event::DomainEvent;

/// Subscription key receiving every event regardless of type.
pub const ALL_EVENTS: &str = "*";

type Listener = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Handle returned by [`EventStore::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct StoreInner {
    /// Global log in append order.
    events: Vec<DomainEvent>,
    /// Current (highest) version per stream.
    versions: HashMap<String, u64>,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    /// Listener lists keyed by event type, or [`ALL_EVENTS`].
    by_type: HashMap<String, Vec<(SubscriptionId, Listener)>>,
}

/// Summary facts about one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub aggregate_id: String,
    pub version: u64,
    pub event_count: usize,
    /// Timestamp of the first event in the stream.
    pub created_at: u64,
    /// Timestamp of the most recent event in the stream.
    pub last_event_at: u64,
}

/// Serializable copy of the whole log, for backup and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreSnapshot {
    /// Wall-clock time the snapshot was taken, Unix epoch milliseconds.
    pub timestamp: u64,
    pub events: Vec<DomainEvent>,
}

/// Append-only event store shared between schedulers and dispatchers.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped, and clones
/// observe the same log and subscriber set.
#[derive(Clone, Default)]
pub struct EventStore {
    inner: Arc<RwLock<StoreInner>>,
    subscribers: Arc<std::sync::Mutex<Subscribers>>,
}

// Manual `Debug` because listeners are opaque closures and the log can be
// large.
impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of events to a stream.
    ///
    /// The whole batch is validated before anything is written: the
    /// caller's `expected_version` must equal the stream's current version,
    /// and the batch's own version numbers must continue the stream without
    /// gaps. On any mismatch nothing is appended.
    ///
    /// Subscribers are notified after the write lock is released, once per
    /// event, in batch order.
    ///
    /// # Arguments
    ///
    /// * `aggregate_id` - Stream to append to; created on first append.
    /// * `expected_version` - Stream version the caller last observed
    ///   (`0` for a new stream).
    /// * `events` - Pre-built records carrying their own version numbers.
    ///
    /// # Returns
    ///
    /// The stream's new current version. An empty batch is a no-op: it
    /// skips the version check entirely and returns the current version
    /// unchanged.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::VersionConflict`] if `expected_version` is stale,
    /// [`EventStoreError::OutOfSequence`] if the batch's version numbers do
    /// not continue the stream.
    pub async fn append_events(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        events: Vec<DomainEvent>,
    ) -> Result<u64, EventStoreError> {
        let appended = {
            let mut inner = self.inner.write().await;
            let current = inner.versions.get(aggregate_id).copied().unwrap_or(0);

            // The no-op short-circuit comes before the concurrency check:
            // an empty batch cannot conflict with anything.
            if events.is_empty() {
                return Ok(current);
            }
            if expected_version != current {
                return Err(EventStoreError::VersionConflict {
                    stream_id: aggregate_id.to_string(),
                    expected: expected_version,
                    actual: current,
                });
            }

            // Validate the whole batch before touching the log.
            for (offset, event) in events.iter().enumerate() {
                let expected_seq = current + 1 + offset as u64;
                if event.version != expected_seq {
                    return Err(EventStoreError::OutOfSequence {
                        stream_id: aggregate_id.to_string(),
                        expected: expected_seq,
                        found: event.version,
                    });
                }
            }

            let new_version = current + events.len() as u64;
            inner.versions.insert(aggregate_id.to_string(), new_version);
            inner.events.extend(events.iter().cloned());

            tracing::debug!(
                stream = %aggregate_id,
                count = events.len(),
                version = new_version,
                "events appended"
            );
            events
        };

        for event in &appended {
            self.notify(event);
        }
        let last = appended
            .last()
            .map(|event| event.version)
            .unwrap_or(expected_version);
        Ok(last)
    }

    fn notify(&self, event: &DomainEvent) {
        let listeners: Vec<Listener> = {
            let subscribers = match self.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut matched = Vec::new();
            for key in [event.event_type.as_str(), ALL_EVENTS] {
                if let Some(list) = subscribers.by_type.get(key) {
                    matched.extend(list.iter().map(|(_, listener)| Arc::clone(listener)));
                }
            }
            matched
        };

        for listener in listeners {
            // A panicking listener must not take down the appender or
            // starve the remaining listeners.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                tracing::warn!(
                    event_type = %event.event_type,
                    reason = %panic_reason(payload),
                    "event listener panicked"
                );
            }
        }
    }

    /// Events of one stream, in version order, with optional inclusive
    /// version bounds.
    pub async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: Option<u64>,
        to_version: Option<u64>,
    ) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|event| event.aggregate_id == aggregate_id)
            .filter(|event| from_version.is_none_or(|from| event.version >= from))
            .filter(|event| to_version.is_none_or(|to| event.version <= to))
            .cloned()
            .collect()
    }

    /// Events of one stream matching an exact type tag, in version order.
    pub async fn events_by_type(&self, aggregate_id: &str, event_type: &str) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|event| event.aggregate_id == aggregate_id)
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Events across every stream stamped at or after `timestamp`, in
    /// append order.
    pub async fn events_from(&self, timestamp: u64) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|event| event.timestamp >= timestamp)
            .cloned()
            .collect()
    }

    /// Events across every stream stamped at or before `timestamp`, in
    /// append order.
    pub async fn events_to(&self, timestamp: u64) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|event| event.timestamp <= timestamp)
            .cloned()
            .collect()
    }

    /// Current version of a stream; `0` if the stream does not exist.
    pub async fn current_version(&self, aggregate_id: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.versions.get(aggregate_id).copied().unwrap_or(0)
    }

    pub async fn stream_exists(&self, aggregate_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner.versions.contains_key(aggregate_id)
    }

    /// Summary facts about a stream, or `None` if it does not exist.
    pub async fn stream_info(&self, aggregate_id: &str) -> Option<StreamInfo> {
        let inner = self.inner.read().await;
        let version = inner.versions.get(aggregate_id).copied()?;
        let mut count = 0;
        let mut first = u64::MAX;
        let mut last = 0;
        for event in inner
            .events
            .iter()
            .filter(|event| event.aggregate_id == aggregate_id)
        {
            count += 1;
            first = first.min(event.timestamp);
            last = last.max(event.timestamp);
        }
        Some(StreamInfo {
            aggregate_id: aggregate_id.to_string(),
            version,
            event_count: count,
            created_at: if count == 0 { 0 } else { first },
            last_event_at: last,
        })
    }

    /// The whole global log in append order.
    pub async fn all_events(&self) -> Vec<DomainEvent> {
        let inner = self.inner.read().await;
        inner.events.clone()
    }

    /// Every known stream ID, sorted.
    pub async fn all_streams(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut streams: Vec<String> = inner.versions.keys().cloned().collect();
        streams.sort();
        streams
    }

    /// Total events across all streams.
    pub async fn event_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.events.len()
    }

    pub async fn stream_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.versions.len()
    }

    /// Take a serializable copy of the whole log.
    pub async fn snapshot(&self) -> EventStoreSnapshot {
        let inner = self.inner.read().await;
        EventStoreSnapshot {
            timestamp: epoch_millis(),
            events: inner.events.clone(),
        }
    }

    /// Replace the log with a snapshot's contents, rebuilding every stream
    /// version counter. Subscribers are kept but not notified.
    pub async fn restore(&self, snapshot: EventStoreSnapshot) {
        let mut inner = self.inner.write().await;
        let mut versions: HashMap<String, u64> = HashMap::new();
        for event in &snapshot.events {
            let entry = versions.entry(event.aggregate_id.clone()).or_insert(0);
            *entry = (*entry).max(event.version);
        }
        let count = snapshot.events.len();
        inner.events = snapshot.events;
        inner.versions = versions;
        tracing::debug!(count, "event store restored from snapshot");
    }

    /// Register a listener for one event type, or for every event via
    /// [`ALL_EVENTS`]. Listeners run synchronously after each append.
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        listener: impl Fn(&DomainEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;
        subscribers
            .by_type
            .entry(event_type.into())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut removed = false;
        for list in subscribers.by_type.values_mut() {
            let before = list.len();
            list.retain(|(sub_id, _)| *sub_id != id);
            removed |= list.len() != before;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn record(aggregate_id: &str, version: u64, event_type: &str) -> DomainEvent {
        DomainEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: crate::event::AGGREGATE_TYPE.to_string(),
            version,
            timestamp: 1_000 + version,
            payload: serde_json::Value::Null,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn append_advances_the_stream_version() {
        let store = EventStore::new();
        let version = store
            .append_events("s-1", 0, vec![record("s-1", 1, "A"), record("s-1", 2, "B")])
            .await
            .expect("append should succeed");
        assert_eq!(version, 2);
        assert_eq!(store.current_version("s-1").await, 2);
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let store = EventStore::new();
        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A")])
            .await
            .expect("append should succeed");

        let err = store
            .append_events("s-1", 0, vec![record("s-1", 1, "B")])
            .await
            .expect_err("stale append should fail");
        assert!(err.is_conflict());
        assert_eq!(
            err,
            EventStoreError::VersionConflict {
                stream_id: "s-1".to_string(),
                expected: 0,
                actual: 1,
            }
        );
        // Nothing was written.
        assert_eq!(store.current_version("s-1").await, 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn gapped_batch_is_rejected_whole() {
        let store = EventStore::new();
        let err = store
            .append_events("s-1", 0, vec![record("s-1", 1, "A"), record("s-1", 3, "B")])
            .await
            .expect_err("gapped batch should fail");
        assert_eq!(
            err,
            EventStoreError::OutOfSequence {
                stream_id: "s-1".to_string(),
                expected: 2,
                found: 3,
            }
        );
        assert_eq!(store.event_count().await, 0);
        assert!(!store.stream_exists("s-1").await);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = EventStore::new();
        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A")])
            .await
            .expect("append should succeed");
        let version = store
            .append_events("s-1", 1, Vec::new())
            .await
            .expect("empty append should succeed");
        assert_eq!(version, 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn empty_batch_ignores_a_stale_expected_version() {
        let store = EventStore::new();
        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A")])
            .await
            .expect("append should succeed");

        // Nothing to append, so even a wildly wrong expected version
        // cannot conflict.
        let version = store
            .append_events("s-1", 7, Vec::new())
            .await
            .expect("empty append should bypass the version check");
        assert_eq!(version, 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn get_events_bounds_are_inclusive() {
        let store = EventStore::new();
        let batch = (1..=5).map(|v| record("s-1", v, "A")).collect();
        store
            .append_events("s-1", 0, batch)
            .await
            .expect("append should succeed");

        let slice = store.get_events("s-1", Some(2), Some(4)).await;
        let versions: Vec<u64> = slice.iter().map(|event| event.version).collect();
        assert_eq!(versions, vec![2, 3, 4]);

        let all = store.get_events("s-1", None, None).await;
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn events_by_type_filters_within_the_stream() {
        let store = EventStore::new();
        store
            .append_events(
                "s-1",
                0,
                vec![
                    record("s-1", 1, "A"),
                    record("s-1", 2, "B"),
                    record("s-1", 3, "A"),
                ],
            )
            .await
            .expect("append should succeed");
        store
            .append_events("s-2", 0, vec![record("s-2", 1, "A")])
            .await
            .expect("append should succeed");

        let matched = store.events_by_type("s-1", "A").await;
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|event| event.aggregate_id == "s-1"));
    }

    #[tokio::test]
    async fn timestamp_ranges_span_all_streams() {
        let store = EventStore::new();
        store
            .append_events(
                "s-1",
                0,
                vec![record("s-1", 1, "A"), record("s-1", 2, "B")],
            )
            .await
            .expect("append should succeed");
        store
            .append_events("s-2", 0, vec![record("s-2", 1, "A")])
            .await
            .expect("append should succeed");

        // record() stamps 1_000 + version.
        let from = store.events_from(1_002).await;
        assert_eq!(from.len(), 1);
        assert_eq!(from[0].aggregate_id, "s-1");
        assert_eq!(from[0].version, 2);

        let to = store.events_to(1_001).await;
        assert_eq!(to.len(), 2);
        assert!(to.iter().any(|event| event.aggregate_id == "s-2"));

        assert_eq!(store.events_from(0).await.len(), 3);
        assert!(store.events_to(0).await.is_empty());
    }

    #[tokio::test]
    async fn streams_are_listed_sorted() {
        let store = EventStore::new();
        store
            .append_events("s-b", 0, vec![record("s-b", 1, "A")])
            .await
            .expect("append should succeed");
        store
            .append_events("s-a", 0, vec![record("s-a", 1, "A")])
            .await
            .expect("append should succeed");

        assert_eq!(store.all_streams().await, vec!["s-a", "s-b"]);
        assert_eq!(store.stream_count().await, 2);
    }

    #[tokio::test]
    async fn stream_info_reports_counts_and_timestamps() {
        let store = EventStore::new();
        assert_eq!(store.stream_info("s-1").await, None);

        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A"), record("s-1", 2, "B")])
            .await
            .expect("append should succeed");
        let info = store
            .stream_info("s-1")
            .await
            .expect("stream should exist");
        assert_eq!(info.version, 2);
        assert_eq!(info.event_count, 2);
        assert_eq!(info.created_at, 1_001);
        assert_eq!(info.last_event_at, 1_002);
    }

    #[tokio::test]
    async fn typed_subscription_only_sees_its_type() {
        let store = EventStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe("A", move |event| {
            sink.lock()
                .expect("lock should not be poisoned")
                .push(event.event_type.clone());
        });

        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A"), record("s-1", 2, "B")])
            .await
            .expect("append should succeed");

        let seen = seen.lock().expect("lock should not be poisoned").clone();
        assert_eq!(seen, vec!["A"]);
    }

    #[tokio::test]
    async fn wildcard_subscription_sees_everything_in_order() {
        let store = EventStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(ALL_EVENTS, move |event| {
            sink.lock()
                .expect("lock should not be poisoned")
                .push(event.version);
        });

        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A"), record("s-1", 2, "B")])
            .await
            .expect("append should succeed");

        let seen = seen.lock().expect("lock should not be poisoned").clone();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let store = EventStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = store.subscribe(ALL_EVENTS, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A")])
            .await
            .expect("append should succeed");
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));

        store
            .append_events("s-1", 1, vec![record("s-1", 2, "B")])
            .await
            .expect("append should succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_break_the_append() {
        let store = EventStore::new();
        store.subscribe(ALL_EVENTS, |_| panic!("listener blew up"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        store.subscribe(ALL_EVENTS, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let version = store
            .append_events("s-1", 0, vec![record("s-1", 1, "A")])
            .await
            .expect("append should survive a panicking listener");
        assert_eq!(version, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let store = EventStore::new();
        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A"), record("s-1", 2, "B")])
            .await
            .expect("append should succeed");
        store
            .append_events("s-2", 0, vec![record("s-2", 1, "A")])
            .await
            .expect("append should succeed");

        let snapshot = store.snapshot().await;
        let json = serde_json::to_string(&snapshot).expect("serialize should succeed");
        let parsed: EventStoreSnapshot =
            serde_json::from_str(&json).expect("deserialize should succeed");

        let fresh = EventStore::new();
        fresh.restore(parsed).await;
        assert_eq!(fresh.event_count().await, 3);
        assert_eq!(fresh.current_version("s-1").await, 2);
        assert_eq!(fresh.current_version("s-2").await, 1);

        // Appends continue from the restored versions.
        fresh
            .append_events("s-1", 2, vec![record("s-1", 3, "C")])
            .await
            .expect("append after restore should succeed");
    }

    #[tokio::test]
    async fn clones_share_the_same_log() {
        let store = EventStore::new();
        let clone = store.clone();
        store
            .append_events("s-1", 0, vec![record("s-1", 1, "A")])
            .await
            .expect("append should succeed");
        assert_eq!(clone.event_count().await, 1);
        assert_eq!(clone.current_version("s-1").await, 1);
    }
}
