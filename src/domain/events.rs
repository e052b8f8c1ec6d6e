//! Cache Events
//!
//! Immutable records of things the cache did on its own: refresh requests
//! produced by the background refresh queue, capacity evictions, bulk
//! invalidations and lifecycle changes. Owners of cached resources
//! subscribe to `RefreshRequested` to refetch and `set` again.

use serde::{Deserialize, Serialize};

/// Why a key was put on the background refresh queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    /// A stale value was served under stale-while-revalidate
    StaleWhileRevalidate,
    /// The entry was stored with `background_refresh` and its TTL elapsed
    Requested,
}

/// Cache event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// The owner of `key` should refetch and call `set` again.
    RefreshRequested {
        key: String,
        reason: RefreshReason,
        at_ms: u64,
    },

    /// An entry was evicted from the fast tier to make room.
    Evicted { key: String, at_ms: u64 },

    /// Keys containing `pattern` were removed from both tiers.
    Invalidated {
        pattern: String,
        removed: usize,
        at_ms: u64,
    },

    /// Both tiers and both queues were emptied.
    Cleared { at_ms: u64 },

    /// A warming item was resolved through the fetcher.
    Warmed { key: String, at_ms: u64 },

    /// The durable tier could not be opened; running memory-only.
    DurableUnavailable { reason: String, at_ms: u64 },
}

impl CacheEvent {
    /// Short event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::RefreshRequested { .. } => "RefreshRequested",
            CacheEvent::Evicted { .. } => "Evicted",
            CacheEvent::Invalidated { .. } => "Invalidated",
            CacheEvent::Cleared { .. } => "Cleared",
            CacheEvent::Warmed { .. } => "Warmed",
            CacheEvent::DurableUnavailable { .. } => "DurableUnavailable",
        }
    }

    /// The cache key the event is about, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::RefreshRequested { key, .. }
            | CacheEvent::Evicted { key, .. }
            | CacheEvent::Warmed { key, .. } => Some(key),
            _ => None,
        }
    }
}
