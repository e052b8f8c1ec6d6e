//! Cache Analytics
//!
//! Lock-free operation counters and latency aggregates. Recording never
//! fails and never blocks a cache operation; the service persists periodic
//! snapshots to the durable tier for trend queries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache analytics collector
#[derive(Debug, Default)]
pub struct CacheAnalytics {
    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    background_refreshes: AtomicU64,
    compressions: AtomicU64,
    stale_hits: AtomicU64,
    evictions: AtomicU64,
    warmed: AtomicU64,
    preloaded: AtomicU64,

    // Exponential moving averages (microseconds)
    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

impl CacheAnalytics {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    // Reads
    pub fn record_memory_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.durable_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    // Writes
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self) {
        self.compressions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    // Background work
    pub fn record_background_refresh(&self) {
        self.background_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warmed(&self) {
        self.warmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preloaded(&self) {
        self.preloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    // Latency tracking
    pub fn record_read_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.read_latency_us, duration);
    }

    pub fn record_write_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.write_latency_us, duration);
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    pub fn write_latency(&self) -> Duration {
        Duration::from_micros(self.write_latency_us.load(Ordering::Relaxed))
    }

    /// `hits / (hits + misses)`, 0 before the first read
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Current counter values
    pub fn counters(&self) -> AnalyticsCounters {
        AnalyticsCounters {
            hits: self.hits(),
            misses: self.misses(),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors(),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            warmed: self.warmed.load(Ordering::Relaxed),
            preloaded: self.preloaded.load(Ordering::Relaxed),
        }
    }

    /// Snapshot for the day bucket containing `now_ms`
    pub fn snapshot(&self, now_ms: u64) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            date: day_bucket(now_ms),
            timestamp: now_ms,
            counters: self.counters(),
            hit_rate: self.hit_rate(),
            avg_read_latency_us: self.read_latency_us.load(Ordering::Relaxed),
            avg_write_latency_us: self.write_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.memory_hits,
            &self.durable_hits,
            &self.sets,
            &self.deletes,
            &self.errors,
            &self.background_refreshes,
            &self.compressions,
            &self.stale_hits,
            &self.evictions,
            &self.warmed,
            &self.preloaded,
            &self.read_latency_us,
            &self.write_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// UTC day bucket (`YYYY-MM-DD`) for an epoch-millisecond timestamp
pub fn day_bucket(timestamp_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms as i64)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

/// Counter values at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsCounters {
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub background_refreshes: u64,
    pub compressions: u64,
    pub stale_hits: u64,
    pub evictions: u64,
    pub warmed: u64,
    pub preloaded: u64,
}

/// Persisted analytics snapshot, one per day bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    /// Day bucket key
    pub date: String,
    /// Snapshot time (epoch ms)
    pub timestamp: u64,
    #[serde(flatten)]
    pub counters: AnalyticsCounters,
    pub hit_rate: f64,
    pub avg_read_latency_us: u64,
    pub avg_write_latency_us: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_without_reads() {
        let analytics = CacheAnalytics::new();
        assert_eq!(analytics.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_arithmetic() {
        let analytics = CacheAnalytics::new();
        analytics.record_memory_hit();
        analytics.record_durable_hit();
        analytics.record_memory_hit();
        analytics.record_miss();

        assert_eq!(analytics.hits(), 3);
        assert_eq!(analytics.misses(), 1);
        assert_eq!(analytics.hit_rate(), 0.75);

        let counters = analytics.counters();
        assert_eq!(counters.memory_hits, 2);
        assert_eq!(counters.durable_hits, 1);
    }

    #[test]
    fn test_latency_ema() {
        let analytics = CacheAnalytics::new();

        analytics.record_read_latency(Duration::from_micros(100));
        assert_eq!(analytics.read_latency(), Duration::from_micros(100));

        analytics.record_read_latency(Duration::from_micros(200));
        let latency = analytics.read_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot_day_bucket() {
        let analytics = CacheAnalytics::new();
        analytics.record_set();
        analytics.record_error();

        // 2024-03-01T12:00:00Z
        let snapshot = analytics.snapshot(1_709_294_400_000);
        assert_eq!(snapshot.date, "2024-03-01");
        assert_eq!(snapshot.counters.sets, 1);
        assert_eq!(snapshot.counters.errors, 1);
    }

    #[test]
    fn test_snapshot_json_is_flat() {
        let analytics = CacheAnalytics::new();
        analytics.record_miss();
        let json = serde_json::to_value(analytics.snapshot(0)).unwrap();
        assert_eq!(json["date"], "1970-01-01");
        assert_eq!(json["misses"], 1);
    }

    #[test]
    fn test_reset() {
        let analytics = CacheAnalytics::new();
        analytics.record_memory_hit();
        analytics.record_eviction();
        analytics.record_write_latency(Duration::from_micros(5));

        analytics.reset();

        assert_eq!(analytics.counters(), AnalyticsCounters::default());
        assert_eq!(analytics.write_latency(), Duration::ZERO);
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.elapsed() >= Duration::from_millis(5));
    }
}
