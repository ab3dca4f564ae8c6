//! Bounded event storage used by destination workers.
//!
//! Events live in one of two lanes:
//!
//! - **fresh**: FIFO of events that have not been scheduled for a retry
//! - **retry**: events waiting for their `retry_at`, sorted by due time
//!
//! Events returned after a failed upload are put back at the front of the
//! fresh lane so they go out before anything enqueued after the failure.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::event::StorageEvent;

/// Default maximum number of events held by a single storage.
pub const DEFAULT_MAX_STORAGE_CAPACITY: usize = 20_000;

/// Storage backing a destination worker.
///
/// Implementations must be safe to call from the worker task while other
/// threads read counts.
pub trait EventStorage: Send + Sync {
    /// Append a fresh event. Returns `false` if the event was dropped.
    fn push_new(&self, event: StorageEvent) -> bool;

    /// Put events back after a delivery attempt.
    ///
    /// Events without `retry_at` are placed at the front of the fresh lane in
    /// the order given; the others are inserted into the retry lane by due time.
    /// Events that no longer fit are handed back to the caller.
    fn return_back(&self, events: Vec<StorageEvent>) -> Vec<StorageEvent>;

    /// Remove and return up to `count` events that are due before `before`,
    /// fresh events first.
    fn pull(&self, count: usize, before: DateTime<Utc>) -> Vec<StorageEvent>;

    /// Number of events that [`pull`](Self::pull) could return at `before`.
    fn count(&self, before: DateTime<Utc>) -> usize;
}

#[derive(Debug, Default)]
struct Lanes {
    fresh: VecDeque<StorageEvent>,
    retry: VecDeque<StorageEvent>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.fresh.len() + self.retry.len()
    }

    fn due_retries(&self, before: DateTime<Utc>) -> usize {
        self.retry
            .iter()
            .take_while(|event| event.is_due(before))
            .count()
    }

    fn insert_retry(&mut self, event: StorageEvent) {
        // Insert after every event with the same due time to keep insertion
        // order among ties.
        let index = self
            .retry
            .partition_point(|queued| queued.retry_at <= event.retry_at);
        self.retry.insert(index, event);
    }
}

/// In-memory two-lane storage with a fixed capacity.
#[derive(Debug)]
pub struct InMemoryEventStorage {
    lanes: RwLock<Lanes>,
    capacity: usize,
}

impl Default for InMemoryEventStorage {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STORAGE_CAPACITY)
    }
}

impl InMemoryEventStorage {
    /// Create a storage that holds at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: RwLock::new(Lanes::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of stored events, due or not.
    pub fn len(&self) -> usize {
        self.lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStorage for InMemoryEventStorage {
    fn push_new(&self, event: StorageEvent) -> bool {
        let mut lanes = self.lanes.write().unwrap_or_else(PoisonError::into_inner);

        if lanes.len() >= self.capacity {
            debug!(
                capacity = self.capacity,
                event_type = %event.event.event_type,
                "Storage full, dropping event"
            );
            return false;
        }

        if event.retry_at.is_some() {
            lanes.insert_retry(event);
        } else {
            lanes.fresh.push_back(event);
        }
        true
    }

    fn return_back(&self, events: Vec<StorageEvent>) -> Vec<StorageEvent> {
        if events.is_empty() {
            return Vec::new();
        }

        let mut lanes = self.lanes.write().unwrap_or_else(PoisonError::into_inner);

        let mut fresh = Vec::new();
        let mut rejected = Vec::new();
        for event in events {
            if lanes.len() + fresh.len() >= self.capacity {
                rejected.push(event);
                continue;
            }

            if event.retry_at.is_some() {
                lanes.insert_retry(event);
            } else {
                fresh.push(event);
            }
        }

        for event in fresh.into_iter().rev() {
            lanes.fresh.push_front(event);
        }

        if !rejected.is_empty() {
            warn!(
                capacity = self.capacity,
                rejected = rejected.len(),
                "Storage full, returned events do not fit"
            );
        }
        rejected
    }

    fn pull(&self, count: usize, before: DateTime<Utc>) -> Vec<StorageEvent> {
        let mut lanes = self.lanes.write().unwrap_or_else(PoisonError::into_inner);

        let from_fresh = count.min(lanes.fresh.len());
        let mut events: Vec<StorageEvent> = lanes.fresh.drain(..from_fresh).collect();

        let from_retry = (count - events.len()).min(lanes.due_retries(before));
        events.extend(lanes.retry.drain(..from_retry));

        events
    }

    fn count(&self, before: DateTime<Utc>) -> usize {
        let lanes = self.lanes.read().unwrap_or_else(PoisonError::into_inner);
        lanes.fresh.len() + lanes.due_retries(before)
    }
}

/// Lets a caller keep a handle on a storage it hands to a destination.
impl<S: EventStorage + ?Sized> EventStorage for std::sync::Arc<S> {
    fn push_new(&self, event: StorageEvent) -> bool {
        (**self).push_new(event)
    }

    fn return_back(&self, events: Vec<StorageEvent>) -> Vec<StorageEvent> {
        (**self).return_back(events)
    }

    fn pull(&self, count: usize, before: DateTime<Utc>) -> Vec<StorageEvent> {
        (**self).pull(count, before)
    }

    fn count(&self, before: DateTime<Utc>) -> usize {
        (**self).count(before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use chrono::Duration;

    fn fresh(name: &str) -> StorageEvent {
        StorageEvent::new(Event::new(name).with_user_id("u"))
    }

    fn delayed(name: &str, at: DateTime<Utc>) -> StorageEvent {
        StorageEvent {
            retry_count: 1,
            retry_at: Some(at),
            ..fresh(name)
        }
    }

    fn names(events: &[StorageEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event.event_type.as_str()).collect()
    }

    #[test]
    fn test_pull_preserves_fifo_order() {
        let storage = InMemoryEventStorage::default();
        for name in ["a", "b", "c"] {
            assert!(storage.push_new(fresh(name)));
        }

        let now = Utc::now();
        assert_eq!(names(&storage.pull(2, now)), ["a", "b"]);
        assert_eq!(names(&storage.pull(2, now)), ["c"]);
        assert!(storage.pull(2, now).is_empty());
    }

    #[test]
    fn test_return_back_prepends_in_original_order() {
        let storage = InMemoryEventStorage::default();
        storage.push_new(fresh("new"));
        storage.return_back(vec![fresh("r1"), fresh("r2")]);

        assert_eq!(names(&storage.pull(10, Utc::now())), ["r1", "r2", "new"]);
    }

    #[test]
    fn test_retry_lane_sorted_with_stable_ties() {
        let storage = InMemoryEventStorage::default();
        let base = Utc::now();

        storage.return_back(vec![
            delayed("late", base + Duration::seconds(3)),
            delayed("early", base + Duration::seconds(1)),
            delayed("tie-1", base + Duration::seconds(2)),
            delayed("tie-2", base + Duration::seconds(2)),
        ]);

        let pulled = storage.pull(10, base + Duration::seconds(10));
        assert_eq!(names(&pulled), ["early", "tie-1", "tie-2", "late"]);
    }

    #[test]
    fn test_pull_skips_retries_not_yet_due() {
        let storage = InMemoryEventStorage::default();
        let now = Utc::now();

        storage.return_back(vec![
            delayed("due", now - Duration::seconds(1)),
            delayed("at-now", now),
            delayed("future", now + Duration::seconds(5)),
        ]);
        storage.push_new(fresh("fresh"));

        assert_eq!(storage.count(now), 2);

        let pulled = storage.pull(10, now);
        assert_eq!(names(&pulled), ["fresh", "due"]);
        assert!(pulled.iter().all(|e| e.is_due(now)));

        assert_eq!(storage.count(now), 0);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn test_pull_respects_count_across_lanes() {
        let storage = InMemoryEventStorage::default();
        let now = Utc::now();

        storage.push_new(fresh("f1"));
        storage.return_back(vec![
            delayed("d1", now - Duration::seconds(2)),
            delayed("d2", now - Duration::seconds(1)),
        ]);

        let pulled = storage.pull(2, now);
        assert_eq!(names(&pulled), ["f1", "d1"]);
        assert_eq!(storage.count(now), 1);
    }

    #[test]
    fn test_capacity_drops_new_events() {
        let storage = InMemoryEventStorage::new(2);
        assert!(storage.push_new(fresh("a")));
        assert!(storage.push_new(fresh("b")));
        assert!(!storage.push_new(fresh("c")));

        let rejected = storage.return_back(vec![fresh("d")]);
        assert_eq!(names(&rejected), ["d"]);
        assert_eq!(storage.len(), 2);
        assert_eq!(names(&storage.pull(10, Utc::now())), ["a", "b"]);
    }

    #[test]
    fn test_no_event_in_both_lanes() {
        let storage = InMemoryEventStorage::default();
        let now = Utc::now();

        storage.return_back(vec![fresh("f"), delayed("d", now - Duration::seconds(1))]);
        let pulled = storage.pull(10, now);

        assert_eq!(names(&pulled), ["f", "d"]);
        assert!(storage.is_empty());
    }
}
