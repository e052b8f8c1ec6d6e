//! Deferred-work queues
//!
//! Keyed maps of pending work, drained by the service timers once an item
//! has waited long enough. Enqueueing a key that is already queued keeps
//! the original item, so bursts of identical requests collapse into one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::entry::FetchRequest;
use crate::domain::events::RefreshReason;

/// Queued work item
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem<T> {
    pub key: String,
    /// Time of the first enqueue (epoch ms)
    pub enqueued_at: u64,
    pub context: T,
}

/// Context of a background refresh
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTask {
    pub reason: RefreshReason,
    /// Known origin of the value, when it was fetched by the cache
    pub source: Option<FetchRequest>,
}

/// Background refresh queue
pub type RefreshQueue = WorkQueue<RefreshTask>;

/// Cache warming queue
pub type WarmingQueue = WorkQueue<FetchRequest>;

/// Outcome of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// New item
    Queued,
    /// Key already queued; original item kept
    Coalesced,
    /// Queue full; item dropped
    Dropped,
}

/// Bounded keyed work queue
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    items: DashMap<String, QueuedItem<T>>,
    max_items: usize,
    dropped: AtomicU64,
}

impl<T: Clone> WorkQueue<T> {
    /// Create a queue holding at most `max_items`
    pub fn new(name: &'static str, max_items: usize) -> Self {
        Self {
            name,
            items: DashMap::new(),
            max_items,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `key` unless it is already queued or the queue is full
    pub fn enqueue(&self, key: &str, context: T, now: u64) -> Enqueued {
        if self.items.contains_key(key) {
            return Enqueued::Coalesced;
        }
        if self.items.len() >= self.max_items {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(queue = self.name, key, "Queue full, dropping item");
            return Enqueued::Dropped;
        }

        match self.items.entry(key.to_string()) {
            Entry::Occupied(_) => Enqueued::Coalesced,
            Entry::Vacant(slot) => {
                slot.insert(QueuedItem {
                    key: key.to_string(),
                    enqueued_at: now,
                    context,
                });
                Enqueued::Queued
            }
        }
    }

    /// Remove and return items that have waited at least `delay`, oldest first
    pub fn drain_ready(&self, now: u64, delay: Duration) -> Vec<QueuedItem<T>> {
        let delay_ms = delay.as_millis() as u64;
        let ready: Vec<String> = self
            .items
            .iter()
            .filter(|item| now.saturating_sub(item.enqueued_at) >= delay_ms)
            .map(|item| item.key().clone())
            .collect();

        let mut drained: Vec<QueuedItem<T>> = ready
            .iter()
            .filter_map(|key| self.items.remove(key).map(|(_, item)| item))
            .collect();
        drained.sort_by_key(|item| item.enqueued_at);
        drained
    }

    /// Drop the item for `key`
    pub fn remove(&self, key: &str) -> bool {
        self.items.remove(key).is_some()
    }

    /// Drop every item whose key contains `pattern`
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|key, _| !key.contains(pattern));
        before.saturating_sub(self.items.len())
    }

    /// Whether `key` is queued
    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Queued item for `key`
    pub fn get(&self, key: &str) -> Option<QueuedItem<T>> {
        self.items.get(key).map(|item| item.clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max: usize) -> WorkQueue<u32> {
        WorkQueue::new("test", max)
    }

    #[test]
    fn test_enqueue_coalesces() {
        let q = queue(10);
        assert_eq!(q.enqueue("a", 1, 100), Enqueued::Queued);
        assert_eq!(q.enqueue("a", 2, 200), Enqueued::Coalesced);

        let item = q.get("a").unwrap();
        assert_eq!(item.enqueued_at, 100);
        assert_eq!(item.context, 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_bounded() {
        let q = queue(2);
        q.enqueue("a", 0, 0);
        q.enqueue("b", 0, 0);
        assert_eq!(q.enqueue("c", 0, 0), Enqueued::Dropped);
        assert_eq!(q.dropped(), 1);
        assert!(!q.contains("c"));
    }

    #[test]
    fn test_drain_respects_delay() {
        let q = queue(10);
        q.enqueue("early", 1, 0);
        q.enqueue("late", 2, 900);

        let drained = q.drain_ready(1_000, Duration::from_millis(500));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].key, "early");
        assert!(q.contains("late"));

        let drained = q.drain_ready(1_400, Duration::from_millis(500));
        assert_eq!(drained[0].key, "late");
        assert!(q.is_empty());
    }

    #[test]
    fn test_drain_is_oldest_first() {
        let q = queue(10);
        q.enqueue("b", 0, 20);
        q.enqueue("a", 0, 10);
        q.enqueue("c", 0, 30);

        let keys: Vec<String> = q
            .drain_ready(100, Duration::ZERO)
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_matching() {
        let q = queue(10);
        q.enqueue("/api/tasks/1", 0, 0);
        q.enqueue("/api/tasks/2", 0, 0);
        q.enqueue("/api/users/1", 0, 0);

        assert_eq!(q.remove_matching("/api/tasks"), 2);
        assert!(q.remove("/api/users/1"));
        assert!(!q.remove("/api/users/1"));
    }
}
