//! Tier composition
//!
//! Both tiers implement [`Tier`]; [`TieredCache`] walks them fastest first.
//! The durable tier is attached after the store initializes and may be
//! absent for the lifetime of the cache. Failures in the durable tier are
//! logged and counted here and never reach the caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::analytics::CacheAnalytics;
use super::durable::DurableTier;
use super::entry::CacheEntry;
use super::memory::MemoryTier;
use crate::error::{Error, Result};

/// Cache tier enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    /// In-memory LRU
    Memory,
    /// Persistent store
    Durable,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Memory => write!(f, "memory"),
            TierKind::Durable => write!(f, "durable"),
        }
    }
}

/// Operations shared by every tier
#[async_trait]
pub trait Tier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Usable entry for `key`, recording the access
    async fn lookup(&self, key: &str, now: u64) -> Result<Option<CacheEntry>>;

    /// Remove `key`; returns whether it was present
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove every key containing `pattern`; returns the removed keys
    async fn remove_matching(&self, pattern: &str) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;
}

#[async_trait]
impl Tier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    async fn lookup(&self, key: &str, now: u64) -> Result<Option<CacheEntry>> {
        Ok(self.get(key, now))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(MemoryTier::remove(self, key).is_some())
    }

    async fn remove_matching(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(MemoryTier::remove_matching(self, pattern))
    }

    async fn clear(&self) -> Result<()> {
        MemoryTier::clear(self);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(MemoryTier::len(self))
    }
}

#[async_trait]
impl Tier for DurableTier {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    async fn lookup(&self, key: &str, now: u64) -> Result<Option<CacheEntry>> {
        self.get(key, now).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.delete(key).await
    }

    async fn remove_matching(&self, pattern: &str) -> Result<Vec<String>> {
        DurableTier::remove_matching(self, pattern).await
    }

    async fn clear(&self) -> Result<()> {
        DurableTier::clear(self).await
    }

    async fn len(&self) -> Result<usize> {
        self.count().await
    }
}

/// Entry found by [`TieredCache::get`]
#[derive(Debug, Clone)]
pub struct Lookup {
    pub entry: CacheEntry,
    pub tier: TierKind,
}

/// Result of a write through both tiers
#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    /// Entry evicted from the memory tier to make room
    pub evicted: Option<CacheEntry>,
    /// Durable copy written
    pub persisted: bool,
    /// Durable copy went through the codec
    pub encoded: bool,
}

/// Memory tier in front of an optional durable tier
pub struct TieredCache {
    memory: Arc<MemoryTier>,
    durable: RwLock<Option<Arc<DurableTier>>>,
    analytics: Arc<CacheAnalytics>,
}

impl TieredCache {
    /// Memory-only cache; attach the durable tier once it is ready
    pub fn new(memory: MemoryTier, analytics: Arc<CacheAnalytics>) -> Self {
        Self {
            memory: Arc::new(memory),
            durable: RwLock::new(None),
            analytics,
        }
    }

    /// Attach an initialized durable tier
    pub fn attach_durable(&self, durable: DurableTier) {
        *self.durable.write() = Some(Arc::new(durable));
    }

    /// Detach the durable tier, returning it
    pub fn detach_durable(&self) -> Option<Arc<DurableTier>> {
        self.durable.write().take()
    }

    /// Durable tier, when attached
    pub fn durable(&self) -> Option<Arc<DurableTier>> {
        self.durable.read().clone()
    }

    pub fn is_durable_available(&self) -> bool {
        self.durable.read().is_some()
    }

    /// Memory tier
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    fn tiers(&self) -> Vec<Arc<dyn Tier>> {
        let mut tiers: Vec<Arc<dyn Tier>> = vec![self.memory.clone()];
        if let Some(durable) = self.durable() {
            tiers.push(durable);
        }
        tiers
    }

    fn record_failure(&self, tier: TierKind, operation: &str, error: Error) {
        warn!(%tier, operation, "Tier operation failed: {}", error);
        self.analytics.record_error();
    }

    /// First tier holding a usable entry for `key`
    pub async fn get(&self, key: &str, now: u64) -> Option<Lookup> {
        for tier in self.tiers() {
            match tier.lookup(key, now).await {
                Ok(Some(entry)) => {
                    return Some(Lookup {
                        entry,
                        tier: tier.kind(),
                    })
                }
                Ok(None) => {}
                Err(e) => self.record_failure(tier.kind(), "get", e),
            }
        }
        None
    }

    /// Durable entry for `key` without recording an access
    pub async fn peek_durable(&self, key: &str, now: u64) -> Option<CacheEntry> {
        let durable = self.durable()?;
        match durable.peek(key, now).await {
            Ok(entry) => entry,
            Err(e) => {
                self.record_failure(TierKind::Durable, "peek", e);
                None
            }
        }
    }

    /// Whether any tier holds an unexpired entry for `key`
    pub async fn contains(&self, key: &str, now: u64) -> bool {
        self.memory.contains(key, now)
            || self
                .peek_durable(key, now)
                .await
                .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Copy a durable entry into the memory tier with a fresh creation time.
    /// Returns the entry evicted to make room.
    pub fn promote(&self, entry: &CacheEntry, now: u64) -> Option<CacheEntry> {
        let mut promoted = entry.clone();
        promoted.created_at = now;
        promoted.last_accessed = now;
        debug!(key = %entry.key, "Promoting durable entry");
        self.memory.insert(promoted)
    }

    /// Write to the memory tier, then persist
    pub async fn set(&self, entry: CacheEntry, compress: bool) -> WriteOutcome {
        let mut outcome = WriteOutcome {
            evicted: self.memory.insert(entry.clone()),
            ..Default::default()
        };

        if let Some(durable) = self.durable() {
            match durable.put(&entry, compress).await {
                Ok(encoded) => {
                    outcome.persisted = true;
                    outcome.encoded = encoded;
                }
                Err(e) => self.record_failure(TierKind::Durable, "put", e),
            }
        }

        outcome
    }

    /// Remove `key` from every tier; returns whether any tier held it
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        for tier in self.tiers() {
            match tier.remove(key).await {
                Ok(found) => removed |= found,
                Err(e) => self.record_failure(tier.kind(), "delete", e),
            }
        }
        removed
    }

    /// Remove every key containing `pattern` from every tier
    pub async fn invalidate(&self, pattern: &str) -> BTreeSet<String> {
        let mut removed = BTreeSet::new();
        for tier in self.tiers() {
            match tier.remove_matching(pattern).await {
                Ok(keys) => removed.extend(keys),
                Err(e) => self.record_failure(tier.kind(), "invalidate", e),
            }
        }
        removed
    }

    /// Empty every tier
    pub async fn clear(&self) {
        for tier in self.tiers() {
            if let Err(e) = tier.clear().await {
                self.record_failure(tier.kind(), "clear", e);
            }
        }
    }

    /// Durable row count, 0 without a durable tier
    pub async fn durable_len(&self) -> usize {
        let Some(durable) = self.durable() else {
            return 0;
        };
        match Tier::len(durable.as_ref()).await {
            Ok(count) => count,
            Err(e) => {
                self.record_failure(TierKind::Durable, "count", e);
                0
            }
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("memory", &self.memory)
            .field("durable", &self.durable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compression::PayloadEncoder;
    use crate::cache::analytics::AnalyticsSnapshot;
    use crate::cache::durable::{DurableStore, InMemoryStore, StoredRecord};
    use crate::cache::memory::MemoryConfig;
    use crate::config::DurableConfig;
    use serde_json::json;
    use std::time::Duration;

    fn cache(max_entries: usize) -> (TieredCache, Arc<InMemoryStore>) {
        let analytics = Arc::new(CacheAnalytics::new());
        let cache = TieredCache::new(
            MemoryTier::with_config(MemoryConfig { max_entries }),
            analytics.clone(),
        );
        let store = Arc::new(InMemoryStore::new());
        cache.attach_durable(DurableTier::new(
            store.clone(),
            PayloadEncoder::default(),
            &DurableConfig::default(),
            analytics,
        ));
        (cache, store)
    }

    fn entry(key: &str, now: u64) -> CacheEntry {
        CacheEntry::new(key, json!(key), Duration::from_secs(60), now)
    }

    #[tokio::test]
    async fn test_memory_hit_first() {
        let (cache, _) = cache(10);
        cache.set(entry("a", 0), true).await;

        let hit = cache.get("a", 1).await.unwrap();
        assert_eq!(hit.tier, TierKind::Memory);
    }

    #[tokio::test]
    async fn test_durable_fallback_and_promote() {
        let (cache, store) = cache(10);
        cache.set(entry("a", 0), true).await;
        cache.memory().clear();

        let hit = cache.get("a", 5).await.unwrap();
        assert_eq!(hit.tier, TierKind::Durable);
        assert_eq!(hit.entry.created_at, 0);

        assert!(cache.promote(&hit.entry, 5).is_none());
        let promoted = cache.memory().get("a", 6).unwrap();
        assert_eq!(promoted.created_at, 5);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_reports_eviction() {
        let (cache, _) = cache(1);
        cache.set(entry("a", 0), true).await;
        let outcome = cache.set(entry("b", 1), true).await;

        assert!(outcome.persisted);
        assert_eq!(outcome.evicted.map(|e| e.key), Some("a".to_string()));
        // Evicted from memory, still durable
        assert_eq!(cache.get("a", 2).await.unwrap().tier, TierKind::Durable);
    }

    #[tokio::test]
    async fn test_delete_and_invalidate_span_tiers() {
        let (cache, store) = cache(1);
        cache.set(entry("/api/tasks/1", 0), true).await;
        cache.set(entry("/api/tasks/2", 0), true).await;
        cache.set(entry("/api/users/1", 0), true).await;

        let removed = cache.invalidate("/api/tasks").await;
        assert_eq!(removed.len(), 2);
        assert_eq!(store.count().await.unwrap(), 1);

        assert!(cache.delete("/api/users/1").await);
        assert!(!cache.delete("/api/users/1").await);
        assert_eq!(cache.durable_len().await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_row_counts_one_error() {
        let (cache, store) = cache(10);
        store
            .put(StoredRecord {
                key: "k".into(),
                payload: vec![8, 0, 0, 0, 0xff, 0xff, 0xff, 0xff],
                codec: Some("lz4".into()),
                created_at: 0,
                ttl_ms: 60_000,
                retention_ms: 86_400_000,
                access_count: 1,
                last_accessed: 0,
                stale_while_revalidate: false,
                background_refresh: false,
                encoded: true,
            })
            .await
            .unwrap();

        assert!(cache.get("k", 1).await.is_none());
        assert!(cache.get("k", 2).await.is_none());
        assert_eq!(cache.analytics.errors(), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    /// Holds every `put` until a permit is released
    struct GatedStore {
        inner: InMemoryStore,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl DurableStore for GatedStore {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
            self.inner.get(key).await
        }

        async fn put(&self, record: StoredRecord) -> Result<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| Error::durable("put", e))?;
            self.inner.put(record).await
        }

        async fn touch(&self, key: &str, accessed_at: u64) -> Result<()> {
            self.inner.touch(key, accessed_at).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }

        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }

        async fn created_before(&self, timestamp: u64) -> Result<Vec<String>> {
            self.inner.created_before(timestamp).await
        }

        async fn least_recently_accessed(&self, limit: usize) -> Result<Vec<String>> {
            self.inner.least_recently_accessed(limit).await
        }

        async fn put_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
            self.inner.put_snapshot(snapshot).await
        }

        async fn snapshots_since(&self, timestamp: u64) -> Result<Vec<AnalyticsSnapshot>> {
            self.inner.snapshots_since(timestamp).await
        }
    }

    #[tokio::test]
    async fn test_set_is_readable_from_memory_before_persisting() {
        let store = Arc::new(GatedStore {
            inner: InMemoryStore::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let cache = Arc::new(TieredCache::new(
            MemoryTier::new(),
            Arc::new(CacheAnalytics::new()),
        ));
        cache.attach_durable(DurableTier::new(
            store.clone(),
            PayloadEncoder::default(),
            &DurableConfig::default(),
            Arc::new(CacheAnalytics::new()),
        ));

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.set(entry("a", 0), true).await })
        };

        // Current-thread runtime: the writer runs until it parks on the gate
        while !cache.memory().contains("a", 1) {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(cache.get("a", 1).await.unwrap().tier, TierKind::Memory);

        store.gate.add_permits(1);
        let outcome = writer.await.unwrap();
        assert!(outcome.persisted);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_only() {
        let analytics = Arc::new(CacheAnalytics::new());
        let cache = TieredCache::new(MemoryTier::new(), analytics.clone());

        let outcome = cache.set(entry("a", 0), true).await;
        assert!(!outcome.persisted);
        assert!(cache.contains("a", 1).await);
        assert_eq!(cache.durable_len().await, 0);
        assert_eq!(analytics.errors(), 0);
    }
}
