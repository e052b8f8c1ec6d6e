//! Cache Service - Layered Read-Through Cache
//!
//! Orchestrates the memory and durable tiers, the revalidation policy, the
//! deferred-work queues and analytics behind one explicitly constructed
//! service.
//!
//! # Lifecycle
//!
//! ```text
//! builder(config) ─► build() ─► init() ─► get/set/... ─► destroy()
//!                                 │                          │
//!                                 ├─ open durable store      ├─ stop timers
//!                                 └─ start timers            ├─ final snapshot
//!                                                            └─ flush
//! ```
//!
//! No operation on the read/write surface returns an error. Failures below
//! it are logged, counted in analytics, and degrade to a miss or a
//! memory-only write.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::analytics::{AnalyticsCounters, AnalyticsSnapshot, CacheAnalytics, LatencyTracker};
use super::compression::{Codec, PayloadEncoder};
use super::durable::{DurableStore, DurableTier, InMemoryStore, SweepReport};
use super::entry::{CacheEntry, FetchRequest, GetOptions, SetOptions};
use super::memory::MemoryTier;
use super::policy::{Assessment, RevalidationPolicy};
use super::queue::{Enqueued, RefreshQueue, RefreshTask, WarmingQueue};
use super::sled_store::SledStore;
use super::tiered::{TierKind, TieredCache};
use crate::adapters::{BroadcastEventPublisher, CompositeEventPublisher, SystemClock};
use crate::config::{CacheConfig, StorageBackend};
use crate::domain::events::{CacheEvent, RefreshReason};
use crate::domain::ports::{Clock, EventPublisher, Fetcher};
use crate::error::Result;

/// Point-in-time view of the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    #[serde(flatten)]
    pub counters: AnalyticsCounters,
    /// `hits / (hits + misses)`
    pub hit_rate: f64,
    pub avg_read_latency_us: u64,
    pub avg_write_latency_us: u64,
    pub memory_size: usize,
    pub memory_max_size: usize,
    pub refresh_queue_len: usize,
    pub warming_queue_len: usize,
    pub durable_available: bool,
}

/// Builder for [`CacheService`]
pub struct CacheServiceBuilder {
    config: CacheConfig,
    clock: Option<Arc<dyn Clock>>,
    codec: Option<Arc<dyn Codec>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    store: Option<Arc<dyn DurableStore>>,
    publishers: CompositeEventPublisher,
}

impl CacheServiceBuilder {
    /// Time source (wall clock by default)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Payload codec for the durable tier (LZ4 by default)
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Fetch capability used by preload, warming and opportunistic refresh
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Durable store, overriding `durable.backend`
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Additional event sink. May be called more than once.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Validate the configuration and assemble the service
    pub fn build(self) -> Result<CacheService> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => Some(store),
            None => match config.durable.backend {
                StorageBackend::Sled => {
                    Some(Arc::new(SledStore::from_config(&config.durable)) as Arc<dyn DurableStore>)
                }
                StorageBackend::Memory => Some(Arc::new(InMemoryStore::new()) as Arc<dyn DurableStore>),
                StorageBackend::Disabled => None,
            },
        };

        let encoder = match self.codec {
            Some(codec) => PayloadEncoder::with_codec(config.encoding.clone(), codec),
            None => PayloadEncoder::new(config.encoding.clone()),
        };

        let analytics = Arc::new(CacheAnalytics::new());
        let tiers = TieredCache::new(
            MemoryTier::with_config(config.memory.clone()),
            analytics.clone(),
        );

        Ok(CacheService {
            policy: RevalidationPolicy::new(
                config.cache.stale_while_revalidate,
                config.cache.stale_grace,
            ),
            refresh_queue: RefreshQueue::new("refresh", config.queues.max_items),
            warming_queue: WarmingQueue::new("warming", config.queues.max_items),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            fetcher: self.fetcher,
            events: BroadcastEventPublisher::default(),
            publishers: self.publishers,
            sources: DashMap::new(),
            in_flight: DashSet::new(),
            shutdown: CancellationToken::new(),
            timers: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            store,
            encoder,
            analytics,
            tiers,
            config,
        })
    }
}

/// Layered response cache
pub struct CacheService {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    tiers: TieredCache,
    store: Option<Arc<dyn DurableStore>>,
    encoder: PayloadEncoder,
    policy: RevalidationPolicy,
    analytics: Arc<CacheAnalytics>,
    refresh_queue: RefreshQueue,
    warming_queue: WarmingQueue,
    fetcher: Option<Arc<dyn Fetcher>>,
    events: BroadcastEventPublisher,
    publishers: CompositeEventPublisher,
    /// Requests that produced cached values, for opportunistic refresh
    sources: DashMap<String, FetchRequest>,
    /// Keys with a fetch in progress
    in_flight: DashSet<String>,
    shutdown: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl CacheService {
    /// Start building a service
    pub fn builder(config: CacheConfig) -> CacheServiceBuilder {
        CacheServiceBuilder {
            config,
            clock: None,
            codec: None,
            fetcher: None,
            store: None,
            publishers: CompositeEventPublisher::new(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the durable tier and start the timers.
    ///
    /// A durable tier that fails to open leaves the service running on the
    /// memory tier alone. Calling `init` again has no effect.
    pub async fn init(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(store) = &self.store {
            match store.initialize().await {
                Ok(()) => {
                    self.tiers.attach_durable(DurableTier::new(
                        store.clone(),
                        self.encoder.clone(),
                        &self.config.durable,
                        self.analytics.clone(),
                    ));
                    info!(backend = store.name(), "Durable tier ready");
                }
                Err(e) => {
                    warn!("Durable tier unavailable, continuing memory-only: {}", e);
                    self.analytics.record_error();
                    self.publish(CacheEvent::DurableUnavailable {
                        reason: e.to_string(),
                        at_ms: self.now(),
                    })
                    .await;
                }
            }
        }

        if self.config.scheduler.enabled {
            self.start_timers();
        }

        info!(
            memory_capacity = self.config.memory.max_entries,
            durable = self.tiers.is_durable_available(),
            timers = self.config.scheduler.enabled,
            "Cache service initialized"
        );
    }

    /// Stop the timers, write a final analytics snapshot and flush the
    /// durable tier. The service keeps serving from memory afterwards.
    pub async fn destroy(&self) {
        self.shutdown.cancel();

        let timers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.timers.lock());
        for timer in timers {
            if let Err(e) = timer.await {
                warn!("Timer task ended abnormally: {}", e);
            }
        }

        self.snapshot_analytics().await;

        if let Some(durable) = self.tiers.detach_durable() {
            if let Err(e) = durable.flush().await {
                warn!("Failed to flush durable tier: {}", e);
                self.analytics.record_error();
            }
        }

        info!("Cache service stopped");
    }

    fn start_timers(self: &Arc<Self>) {
        let scheduler = self.config.scheduler.clone();

        self.spawn_timer("expiry_sweep", scheduler.expiry_sweep_interval, |svc| async move {
            svc.sweep_expired();
        });
        self.spawn_timer("refresh_drain", scheduler.refresh_interval, |svc| async move {
            svc.drain_refresh_queue().await;
        });
        self.spawn_timer("warming_drain", scheduler.warming_interval, |svc| async move {
            svc.drain_warming_queue().await;
        });
        self.spawn_timer("durable_sweep", scheduler.durable_sweep_interval, |svc| async move {
            svc.sweep_durable().await;
        });
        if self.config.analytics.persist_snapshots {
            self.spawn_timer(
                "analytics_snapshot",
                self.config.analytics.snapshot_interval,
                |svc| async move {
                    svc.snapshot_analytics().await;
                },
            );
        }
    }

    /// Run `task` every `period` until shutdown or until the service is dropped
    fn spawn_timer<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, task: F)
    where
        F: Fn(Arc<CacheService>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service = Arc::downgrade(self);
        let shutdown = self.shutdown.child_token();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(timer = name, "Timer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(svc) = service.upgrade() else {
                            break;
                        };
                        task(svc).await;
                    }
                }
            }
        });

        self.timers.lock().push(handle);
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Cached payload for `key`, or `None` when the caller must fetch
    pub async fn get(&self, key: &str, options: GetOptions) -> Option<Value> {
        let tracker = LatencyTracker::start();
        let result = self.read(key, options).await;
        self.analytics.record_read_latency(tracker.elapsed());
        result
    }

    async fn read(&self, key: &str, options: GetOptions) -> Option<Value> {
        if options.force_refresh {
            debug!(key, "Forced refresh, bypassing cache");
            self.analytics.record_miss();
            return None;
        }

        let now = self.now();
        let Some(hit) = self.tiers.get(key, now).await else {
            debug!(key, "Cache miss");
            self.analytics.record_miss();
            return None;
        };

        if hit.tier == TierKind::Memory {
            self.analytics.record_memory_hit();
            return Some(hit.entry.payload);
        }

        let assessment = self
            .policy
            .assess(&hit.entry, now, options.use_stale_while_revalidate);

        if let Some(reason) = assessment.refresh() {
            self.request_refresh(key, reason, now);
        }

        match assessment {
            Assessment::Serve { stale, refresh } => {
                if refresh == Some(RefreshReason::StaleWhileRevalidate) {
                    self.analytics.record_stale_hit();
                }
                let evicted = self.tiers.promote(&hit.entry, now);
                self.handle_eviction(evicted, now).await;
                self.analytics.record_durable_hit();
                debug!(key, stale, "Durable hit");
                Some(hit.entry.payload)
            }
            Assessment::Reject { .. } => {
                debug!(key, "Durable entry expired");
                self.analytics.record_miss();
                None
            }
        }
    }

    /// Typed [`get`](Self::get)
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str, options: GetOptions) -> Option<T> {
        let value = self.get(key, options).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, "Cached payload does not match the requested type: {}", e);
                self.analytics.record_error();
                None
            }
        }
    }

    fn request_refresh(&self, key: &str, reason: RefreshReason, now: u64) {
        let source = self.sources.get(key).map(|s| s.clone());
        match self
            .refresh_queue
            .enqueue(key, RefreshTask { reason, source }, now)
        {
            Enqueued::Queued => debug!(key, ?reason, "Queued background refresh"),
            Enqueued::Coalesced => debug!(key, "Background refresh already queued"),
            Enqueued::Dropped => {}
        }
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Store `payload` under `key` in both tiers.
    /// `ttl` defaults to `cache.default_ttl`.
    pub async fn set(&self, key: &str, payload: Value, ttl: Option<Duration>, options: SetOptions) {
        let tracker = LatencyTracker::start();
        let now = self.now();
        let ttl = ttl.unwrap_or(self.config.cache.default_ttl);

        let entry = CacheEntry::new(key, payload, ttl, now).with_options(&options);
        let outcome = self.tiers.set(entry, options.compress).await;

        self.analytics.record_set();
        if outcome.encoded {
            self.analytics.record_compression();
        }
        self.refresh_queue.remove(key);
        self.handle_eviction(outcome.evicted, now).await;

        self.analytics.record_write_latency(tracker.elapsed());
        debug!(key, ttl_ms = ttl.as_millis() as u64, persisted = outcome.persisted, "Cache set");
    }

    /// Typed [`set`](Self::set)
    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        payload: &T,
        ttl: Option<Duration>,
        options: SetOptions,
    ) {
        match serde_json::to_value(payload) {
            Ok(value) => self.set(key, value, ttl, options).await,
            Err(e) => {
                warn!(key, "Payload is not serializable: {}", e);
                self.analytics.record_error();
            }
        }
    }

    async fn handle_eviction(&self, evicted: Option<CacheEntry>, now: u64) {
        if let Some(entry) = evicted {
            debug!(key = %entry.key, "Evicted from memory tier");
            self.analytics.record_eviction();
            if !self.tiers.is_durable_available() {
                self.sources.remove(&entry.key);
            }
            self.publish(CacheEvent::Evicted {
                key: entry.key,
                at_ms: now,
            })
            .await;
        }
    }

    // =========================================================================
    // Deletion & invalidation
    // =========================================================================

    /// Remove `key` from both tiers and both queues.
    /// Returns whether either tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.tiers.delete(key).await;
        self.refresh_queue.remove(key);
        self.warming_queue.remove(key);
        self.sources.remove(key);
        self.analytics.record_delete();
        debug!(key, removed, "Cache delete");
        removed
    }

    /// Empty both tiers and both queues
    pub async fn clear(&self) {
        self.tiers.clear().await;
        self.refresh_queue.clear();
        self.warming_queue.clear();
        self.sources.clear();
        info!("Cache cleared");
        self.publish(CacheEvent::Cleared { at_ms: self.now() }).await;
    }

    /// Remove every key containing `pattern` from both tiers and drop queued
    /// work for those keys. Returns the number of distinct keys removed.
    ///
    /// An empty pattern removes nothing.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        if pattern.is_empty() {
            warn!("Ignoring invalidation with an empty pattern");
            return 0;
        }

        let removed = self.tiers.invalidate(pattern).await;
        self.refresh_queue.remove_matching(pattern);
        self.warming_queue.remove_matching(pattern);
        self.sources.retain(|key, _| !key.contains(pattern));

        for _ in &removed {
            self.analytics.record_delete();
        }

        info!(pattern, removed = removed.len(), "Pattern invalidated");
        self.publish(CacheEvent::Invalidated {
            pattern: pattern.to_string(),
            removed: removed.len(),
            at_ms: self.now(),
        })
        .await;
        removed.len()
    }

    // =========================================================================
    // Preloading & warming
    // =========================================================================

    /// Fetch every request now, concurrently, and cache the results.
    /// Returns how many were fetched and stored.
    ///
    /// Requests for a key that is already being fetched are skipped.
    pub async fn preload(&self, requests: Vec<FetchRequest>) -> usize {
        let Some(fetcher) = self.fetcher.clone() else {
            warn!("Preload requested without a fetcher");
            return 0;
        };

        let pending: Vec<_> = requests
            .into_iter()
            .filter_map(|request| {
                let key = request.cache_key();
                if !self.in_flight.insert(key.clone()) {
                    debug!(key = %key, "Fetch already in flight");
                    return None;
                }
                Some(self.fetch_and_store(fetcher.as_ref(), key, request))
            })
            .collect();

        let stored = join_all(pending).await.into_iter().filter(|ok| *ok).count();
        for _ in 0..stored {
            self.analytics.record_preloaded();
        }
        info!(stored, "Preload complete");
        stored
    }

    /// Queue the requests whose keys are in neither tier.
    /// Returns how many were queued.
    pub async fn warm_cache(&self, requests: Vec<FetchRequest>) -> usize {
        let now = self.now();
        let mut queued = 0;

        for request in requests {
            let key = request.cache_key();
            if self.tiers.contains(&key, now).await {
                continue;
            }
            if self.warming_queue.enqueue(&key, request, now) == Enqueued::Queued {
                queued += 1;
            }
        }

        debug!(queued, "Warming requests queued");
        queued
    }

    async fn fetch_and_store(&self, fetcher: &dyn Fetcher, key: String, request: FetchRequest) -> bool {
        let result = fetcher.fetch(&request).await;
        self.in_flight.remove(&key);

        match result {
            Ok(payload) => {
                let (ttl, options) = (request.ttl, request.options);
                // Before the write, so a concurrent eviction of this key drops it
                self.sources.insert(key.clone(), request);
                self.set(&key, payload, ttl, options).await;
                true
            }
            Err(e) => {
                warn!(key = %key, "Fetch failed: {}", e);
                self.analytics.record_error();
                false
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove expired entries from the memory tier
    #[instrument(skip(self))]
    pub fn sweep_expired(&self) -> usize {
        let now = self.now();
        let removed = self.tiers.memory().sweep_expired(now);
        if removed > 0 {
            debug!(removed, "Expired entries swept");
        }
        if !self.tiers.is_durable_available() {
            let memory = self.tiers.memory();
            self.sources.retain(|key, _| memory.contains(key, now));
        }
        removed
    }

    /// Drain refresh items that have waited `queues.refresh_delay`.
    ///
    /// Each drained key is announced with `RefreshRequested`. Keys whose
    /// value came from a known request are refetched when a fetcher is
    /// configured. Returns how many items were drained.
    #[instrument(skip(self))]
    pub async fn drain_refresh_queue(&self) -> usize {
        let now = self.now();
        let items = self
            .refresh_queue
            .drain_ready(now, self.config.queues.refresh_delay);
        let drained = items.len();
        let mut refetch = Vec::new();

        for item in items {
            self.analytics.record_background_refresh();
            self.publish(CacheEvent::RefreshRequested {
                key: item.key.clone(),
                reason: item.context.reason,
                at_ms: now,
            })
            .await;

            if let (Some(source), Some(fetcher)) = (item.context.source, self.fetcher.as_deref()) {
                if self.in_flight.insert(item.key.clone()) {
                    refetch.push(self.fetch_and_store(fetcher, item.key, source));
                }
            }
        }

        let refetched = join_all(refetch).await.into_iter().filter(|ok| *ok).count();
        if drained > 0 {
            debug!(drained, refetched, "Refresh queue drained");
        }
        drained
    }

    /// Resolve warming items that have waited `queues.warming_delay` and
    /// whose keys are still absent. Returns how many were fetched.
    #[instrument(skip(self))]
    pub async fn drain_warming_queue(&self) -> usize {
        let now = self.now();
        let items = self
            .warming_queue
            .drain_ready(now, self.config.queues.warming_delay);
        if items.is_empty() {
            return 0;
        }

        let Some(fetcher) = self.fetcher.clone() else {
            debug!(dropped = items.len(), "No fetcher, dropping warming items");
            return 0;
        };

        let mut pending = Vec::new();
        for item in items {
            if self.tiers.contains(&item.key, now).await {
                debug!(key = %item.key, "Already cached, skipping warm");
                continue;
            }
            if !self.in_flight.insert(item.key.clone()) {
                continue;
            }
            let fetcher_ref = fetcher.as_ref();
            pending.push(async move {
                let ok = self
                    .fetch_and_store(fetcher_ref, item.key.clone(), item.context)
                    .await;
                (item.key, ok)
            });
        }

        let mut warmed = 0;
        for (key, ok) in join_all(pending).await {
            if ok {
                warmed += 1;
                self.analytics.record_warmed();
                self.publish(CacheEvent::Warmed {
                    key,
                    at_ms: self.now(),
                })
                .await;
            }
        }
        debug!(warmed, "Warming queue drained");
        warmed
    }

    /// Remove durable rows past retention or abandoned, and trim the durable
    /// tier to `durable.max_entries`
    #[instrument(skip(self))]
    pub async fn sweep_durable(&self) -> SweepReport {
        let Some(durable) = self.tiers.durable() else {
            return SweepReport::default();
        };

        match durable.sweep(self.now()).await {
            Ok(report) => {
                if report != SweepReport::default() {
                    info!(
                        expired = report.expired,
                        abandoned = report.abandoned,
                        trimmed = report.trimmed,
                        "Durable tier swept"
                    );
                }
                self.prune_sources(&durable).await;
                report
            }
            Err(e) => {
                warn!("Durable sweep failed: {}", e);
                self.analytics.record_error();
                SweepReport::default()
            }
        }
    }

    async fn prune_sources(&self, durable: &DurableTier) {
        let now = self.now();
        let keys: Vec<String> = self.sources.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            if self.tiers.memory().contains(&key, now) {
                continue;
            }
            if let Ok(None) = durable.peek(&key, now).await {
                self.sources.remove(&key);
            }
        }
    }

    /// Persist the current analytics as today's snapshot
    #[instrument(skip(self))]
    pub async fn snapshot_analytics(&self) {
        if !self.config.analytics.persist_snapshots {
            return;
        }
        let Some(durable) = self.tiers.durable() else {
            return;
        };

        let snapshot = self.analytics.snapshot(self.now());
        if let Err(e) = durable.put_snapshot(&snapshot).await {
            warn!("Failed to persist analytics snapshot: {}", e);
            self.analytics.record_error();
        } else {
            debug!(date = %snapshot.date, "Analytics snapshot persisted");
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Current counters, rates and sizes
    pub fn stats(&self) -> CacheStats {
        let snapshot = self.analytics.snapshot(self.now());
        let memory = self.tiers.memory();

        CacheStats {
            counters: snapshot.counters,
            hit_rate: snapshot.hit_rate,
            avg_read_latency_us: snapshot.avg_read_latency_us,
            avg_write_latency_us: snapshot.avg_write_latency_us,
            memory_size: memory.len(),
            memory_max_size: memory.capacity(),
            refresh_queue_len: self.refresh_queue.len(),
            warming_queue_len: self.warming_queue.len(),
            durable_available: self.tiers.is_durable_available(),
        }
    }

    /// Durable row count, 0 when the durable tier is unavailable
    pub async fn cache_size(&self) -> usize {
        self.tiers.durable_len().await
    }

    /// Persisted analytics snapshots taken at or after `since_ms`
    pub async fn analytics_history(&self, since_ms: u64) -> Vec<AnalyticsSnapshot> {
        let Some(durable) = self.tiers.durable() else {
            return Vec::new();
        };
        match durable.snapshots_since(since_ms).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to read analytics history: {}", e);
                self.analytics.record_error();
                Vec::new()
            }
        }
    }

    /// Zero all counters
    pub fn reset_analytics(&self) {
        self.analytics.reset();
    }

    /// Receive cache events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Configuration in use
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    async fn publish(&self, event: CacheEvent) {
        let _ = self.events.publish(event.clone()).await;
        if !self.publishers.is_empty() {
            if let Err(e) = self.publishers.publish(event).await {
                warn!("Event publisher failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("tiers", &self.tiers)
            .field("refresh_queue", &self.refresh_queue.len())
            .field("warming_queue", &self.warming_queue.len())
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, ManualClock};
    use crate::error::Error;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const START: u64 = 1_700_000_000_000;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if request.url.contains("fail") {
                return Err(Error::Fetch {
                    url: request.url.clone(),
                    reason: "boom".into(),
                });
            }
            Ok(json!({ "url": request.url }))
        }
    }

    fn service(config: CacheConfig) -> (Arc<CacheService>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let service = CacheService::builder(config)
            .clock(clock.clone())
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();
        (Arc::new(service), clock)
    }

    #[tokio::test]
    async fn test_set_get() {
        let (cache, _) = service(CacheConfig::ephemeral());
        cache.init().await;

        cache
            .set("/api/tasks", json!([1, 2]), None, SetOptions::default())
            .await;
        assert_eq!(
            cache.get("/api/tasks", GetOptions::default()).await,
            Some(json!([1, 2]))
        );

        let stats = cache.stats();
        assert_eq!(stats.counters.memory_hits, 1);
        assert_eq!(stats.counters.sets, 1);
        assert!(stats.durable_available);
    }

    #[tokio::test]
    async fn test_force_refresh_is_a_miss() {
        let (cache, _) = service(CacheConfig::ephemeral());
        cache.init().await;
        cache.set("k", json!(1), None, SetOptions::default()).await;

        assert!(cache.get("k", GetOptions::force_refresh()).await.is_none());
        assert_eq!(cache.stats().counters.misses, 1);
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Task {
            id: u32,
            title: String,
        }

        let (cache, _) = service(CacheConfig::ephemeral());
        cache.init().await;

        let task = Task {
            id: 7,
            title: "write tests".into(),
        };
        cache.set_as("task:7", &task, None, SetOptions::default()).await;

        let back: Option<Task> = cache.get_as("task:7", GetOptions::default()).await;
        assert_eq!(back, Some(task));

        let wrong: Option<Vec<u8>> = cache.get_as("task:7", GetOptions::default()).await;
        assert!(wrong.is_none());
        assert_eq!(cache.stats().counters.errors, 1);
    }

    #[tokio::test]
    async fn test_eviction_is_published() {
        let mut config = CacheConfig::ephemeral();
        config.memory.max_entries = 1;
        let collector = Arc::new(InMemoryEventCollector::new());
        let cache = Arc::new(
            CacheService::builder(config)
                .clock(Arc::new(ManualClock::new(START)))
                .publisher(collector.clone())
                .build()
                .unwrap(),
        );
        cache.init().await;

        cache.set("a", json!(1), None, SetOptions::default()).await;
        cache.set("b", json!(2), None, SetOptions::default()).await;

        assert_eq!(cache.stats().counters.evictions, 1);
        assert_eq!(collector.events_of_type("Evicted").len(), 1);
    }

    #[tokio::test]
    async fn test_set_clears_pending_refresh() {
        let (cache, clock) = service(CacheConfig::ephemeral());
        cache.init().await;

        let options = SetOptions {
            background_refresh: true,
            ..Default::default()
        };
        cache
            .set("k", json!(1), Some(Duration::from_millis(10)), options)
            .await;
        clock.advance(Duration::from_millis(20));

        // Expired in memory, expired in durable: miss, refresh queued
        assert!(cache.get("k", GetOptions::default()).await.is_none());
        assert_eq!(cache.stats().refresh_queue_len, 1);

        cache.set("k", json!(2), None, SetOptions::default()).await;
        assert_eq!(cache.stats().refresh_queue_len, 0);
    }

    #[tokio::test]
    async fn test_preload_failures_are_counted() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(
            CacheService::builder(CacheConfig::ephemeral())
                .fetcher(fetcher.clone())
                .build()
                .unwrap(),
        );
        cache.init().await;

        let stored = cache
            .preload(vec![FetchRequest::new("/ok"), FetchRequest::new("/fail")])
            .await;
        assert_eq!(stored, 1);

        let stats = cache.stats();
        assert_eq!(stats.counters.preloaded, 1);
        assert_eq!(stats.counters.errors, 1);
    }

    #[tokio::test]
    async fn test_preload_without_fetcher() {
        let (cache, _) = service(CacheConfig::ephemeral());
        assert_eq!(cache.preload(vec![FetchRequest::new("/x")]).await, 0);
    }

    #[tokio::test]
    async fn test_memory_only_sources_follow_evictions() {
        let mut config = CacheConfig::ephemeral();
        config.durable.backend = StorageBackend::Disabled;
        config.memory.max_entries = 1;
        let clock = Arc::new(ManualClock::new(START));
        let cache = Arc::new(
            CacheService::builder(config)
                .clock(clock.clone())
                .fetcher(Arc::new(CountingFetcher {
                    calls: AtomicUsize::new(0),
                }))
                .build()
                .unwrap(),
        );
        cache.init().await;

        let requests = (0..5)
            .map(|i| FetchRequest::new(format!("/api/items/{}", i)).with_ttl(Duration::from_secs(10)))
            .collect();
        assert_eq!(cache.preload(requests).await, 5);
        assert_eq!(cache.sources.len(), 1);

        clock.advance(Duration::from_secs(11));
        cache.sweep_expired();
        assert!(cache.sources.is_empty());
    }

    #[tokio::test]
    async fn test_durable_sweep_prunes_sources_without_removals() {
        let store = Arc::new(InMemoryStore::new());
        let mut config = CacheConfig::ephemeral();
        config.memory.max_entries = 1;
        let cache = Arc::new(
            CacheService::builder(config)
                .clock(Arc::new(ManualClock::new(START)))
                .store(store.clone())
                .fetcher(Arc::new(CountingFetcher {
                    calls: AtomicUsize::new(0),
                }))
                .build()
                .unwrap(),
        );
        cache.init().await;

        cache
            .preload(vec![FetchRequest::new("/a"), FetchRequest::new("/b")])
            .await;
        assert_eq!(cache.sources.len(), 2);

        // "/a" now lives only in the durable tier; drop its row underneath
        store.delete("/a").await.unwrap();

        assert_eq!(cache.sweep_durable().await, SweepReport::default());
        assert!(!cache.sources.contains_key("/a"));
        assert!(cache.sources.contains_key("/b"));
    }

    #[tokio::test]
    async fn test_empty_pattern_removes_nothing() {
        let (cache, _) = service(CacheConfig::ephemeral());
        cache.init().await;
        cache.set("k", json!(1), None, SetOptions::default()).await;

        assert_eq!(cache.invalidate_pattern("").await, 0);
        assert!(cache.get("k", GetOptions::default()).await.is_some());
    }

    #[tokio::test]
    async fn test_disabled_backend_is_memory_only() {
        let mut config = CacheConfig::ephemeral();
        config.durable.backend = StorageBackend::Disabled;
        let cache = Arc::new(CacheService::builder(config).build().unwrap());
        cache.init().await;

        cache.set("k", json!(1), None, SetOptions::default()).await;
        assert_eq!(cache.cache_size().await, 0);
        assert!(!cache.stats().durable_available);
        assert_eq!(cache.stats().counters.errors, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = CacheConfig::ephemeral();
        config.memory.max_entries = 0;
        assert!(CacheService::builder(config).build().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_run_and_stop() {
        let mut config = CacheConfig::ephemeral();
        config.scheduler.enabled = true;
        config.scheduler.expiry_sweep_interval = Duration::from_millis(100);
        let (cache, clock) = service(config);
        cache.init().await;

        cache
            .set("short", json!(1), Some(Duration::from_millis(5)), SetOptions::default())
            .await;
        clock.advance(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.stats().memory_size, 0);

        cache.destroy().await;
        assert!(!cache.stats().durable_available);
    }
}
