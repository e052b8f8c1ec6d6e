//! Fast Tier - In-Memory LRU Cache
//!
//! Bounded map with least-recently-used eviction and lazy TTL expiry.
//!
//! # Design
//!
//! - Capacity is a fixed entry count, sized for hundreds of entries
//! - Insert at capacity scans all entries and evicts the one with the
//!   smallest `last_accessed` (O(n), ties broken arbitrarily)
//! - Expired entries are removed on access and by the periodic sweep
//! - Overwriting an existing key never evicts

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use super::DEFAULT_MEMORY_MAX_ENTRIES;

/// Fast tier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
        }
    }
}

/// Fast tier
pub struct MemoryTier {
    entries: Mutex<HashMap<String, CacheEntry>>,
    config: MemoryConfig,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl MemoryTier {
    /// Create with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(config.max_entries)),
            config,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up an unexpired entry and record the access.
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &str, now: u64) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.record_access(now);
                return Some(entry.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Whether an unexpired entry exists, without recording an access
    pub fn contains(&self, key: &str, now: u64) -> bool {
        self.entries
            .lock()
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Insert or overwrite. Returns the entry evicted to make room, if any.
    pub fn insert(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();

        let evicted = if !entries.contains_key(&entry.key) && entries.len() >= self.config.max_entries
        {
            Self::least_recently_accessed(&entries).and_then(|key| entries.remove(&key))
        } else {
            None
        };

        if evicted.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        entries.insert(entry.key.clone(), entry);
        evicted
    }

    fn least_recently_accessed(entries: &HashMap<String, CacheEntry>) -> Option<String> {
        entries
            .values()
            .min_by_key(|e| e.last_accessed)
            .map(|e| e.key.clone())
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().remove(key)
    }

    /// Remove every key containing `pattern`; returns the removed keys
    pub fn remove_matching(&self, pattern: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        let matched: Vec<String> = entries
            .keys()
            .filter(|k| k.contains(pattern))
            .cloned()
            .collect();
        for key in &matched {
            entries.remove(key);
        }
        matched
    }

    /// Remove every expired entry; returns how many were removed
    pub fn sweep_expired(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// All keys currently held (expired or not)
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    /// Capacity evictions so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Expired entries removed so far
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Clear the tier
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("entries", &self.len())
            .field("capacity", &self.capacity())
            .field("evictions", &self.evictions())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
