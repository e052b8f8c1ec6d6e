//! Durable Tier - Persistent Indexed Store
//!
//! Asynchronous on-device key-value store that holds a superset of the fast
//! tier with a longer retention. Survives restarts.
//!
//! # Design
//!
//! - Pluggable backend behind [`DurableStore`] (sled on disk, memory for tests)
//! - Rows carry the full entry metadata plus the encoded payload
//! - Secondary indices on creation time (retention sweep) and last access
//!   (capacity trim)
//! - A second table of daily analytics snapshots indexed by timestamp

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::analytics::{AnalyticsSnapshot, CacheAnalytics};
use super::compression::PayloadEncoder;
use super::entry::CacheEntry;
use crate::config::DurableConfig;
use crate::error::Result;

/// Persisted row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    /// JSON bytes, or codec output when `codec` is set
    pub payload: Vec<u8>,
    pub codec: Option<String>,
    pub created_at: u64,
    pub ttl_ms: u64,
    pub retention_ms: u64,
    pub access_count: u64,
    pub last_accessed: u64,
    pub stale_while_revalidate: bool,
    pub background_refresh: bool,
    pub encoded: bool,
}

impl StoredRecord {
    /// Past the row's own retention
    pub fn is_retention_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > self.retention_ms
    }

    /// Not read for more than twice its TTL and not eligible for
    /// stale-while-revalidate, so no read can return it again
    pub fn is_abandoned(&self, now: u64) -> bool {
        !self.stale_while_revalidate
            && now.saturating_sub(self.last_accessed) > self.ttl_ms.saturating_mul(2)
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Durable storage backend
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Open the underlying storage. Called once by the service before use.
    async fn initialize(&self) -> Result<()>;

    /// Get a row
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>>;

    /// Insert or replace a row, maintaining both indices
    async fn put(&self, record: StoredRecord) -> Result<()>;

    /// Update access metadata of an existing row
    async fn touch(&self, key: &str, accessed_at: u64) -> Result<()>;

    /// Delete a row; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete all rows (snapshots are kept)
    async fn clear(&self) -> Result<()>;

    /// Number of rows
    async fn count(&self) -> Result<usize>;

    /// All row keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Keys of rows created strictly before `timestamp` (creation index)
    async fn created_before(&self, timestamp: u64) -> Result<Vec<String>>;

    /// Up to `limit` keys, least recently accessed first (access index)
    async fn least_recently_accessed(&self, limit: usize) -> Result<Vec<String>>;

    /// Upsert the snapshot for its day bucket
    async fn put_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()>;

    /// Snapshots taken at or after `timestamp`, oldest first
    async fn snapshots_since(&self, timestamp: u64) -> Result<Vec<AnalyticsSnapshot>>;

    /// Flush pending writes
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory durable store for tests and ephemeral sessions
#[derive(Default)]
pub struct InMemoryStore {
    rows: DashMap<String, StoredRecord>,
    snapshots: DashMap<String, AnalyticsSnapshot>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        Ok(self.rows.get(key).map(|r| r.clone()))
    }

    async fn put(&self, record: StoredRecord) -> Result<()> {
        self.rows.insert(record.key.clone(), record);
        Ok(())
    }

    async fn touch(&self, key: &str, accessed_at: u64) -> Result<()> {
        if let Some(mut row) = self.rows.get_mut(key) {
            row.last_accessed = accessed_at;
            row.access_count += 1;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.rows.remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.len())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.rows.iter().map(|r| r.key().clone()).collect())
    }

    async fn created_before(&self, timestamp: u64) -> Result<Vec<String>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.created_at < timestamp)
            .map(|r| r.key().clone())
            .collect())
    }

    async fn least_recently_accessed(&self, limit: usize) -> Result<Vec<String>> {
        let mut rows: Vec<(u64, String)> = self
            .rows
            .iter()
            .map(|r| (r.last_accessed, r.key().clone()))
            .collect();
        rows.sort();
        Ok(rows.into_iter().take(limit).map(|(_, k)| k).collect())
    }

    async fn put_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        self.snapshots
            .insert(snapshot.date.clone(), snapshot.clone());
        Ok(())
    }

    async fn snapshots_since(&self, timestamp: u64) -> Result<Vec<AnalyticsSnapshot>> {
        let mut snapshots: Vec<AnalyticsSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| s.timestamp >= timestamp)
            .map(|s| s.clone())
            .collect();
        snapshots.sort_by_key(|s| s.timestamp);
        Ok(snapshots)
    }
}

// =============================================================================
// Durable tier
// =============================================================================

/// Result of a durable sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows past retention
    pub expired: usize,
    /// Abandoned rows
    pub abandoned: usize,
    /// Rows trimmed to respect `max_entries`
    pub trimmed: usize,
}

/// Durable tier: encoding, retention and promotion on top of a store
pub struct DurableTier {
    store: Arc<dyn DurableStore>,
    encoder: PayloadEncoder,
    retention: Duration,
    max_entries: usize,
    analytics: Arc<CacheAnalytics>,
}

impl DurableTier {
    /// Create a tier over an initialized store
    pub fn new(
        store: Arc<dyn DurableStore>,
        encoder: PayloadEncoder,
        config: &DurableConfig,
        analytics: Arc<CacheAnalytics>,
    ) -> Self {
        Self {
            store,
            encoder,
            retention: config.retention,
            max_entries: config.max_entries,
            analytics,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Read, decode and record the access. Expired rows are deleted.
    pub async fn get(&self, key: &str, now: u64) -> Result<Option<CacheEntry>> {
        let mut entry = match self.peek(key, now).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if let Err(e) = self.store.touch(key, now).await {
            warn!(key, "Failed to update durable access metadata: {}", e);
            self.analytics.record_error();
        }
        entry.record_access(now);
        Ok(Some(entry))
    }

    /// Read and decode without recording an access
    pub async fn peek(&self, key: &str, now: u64) -> Result<Option<CacheEntry>> {
        let record = match self.store.get(key).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        if record.is_retention_expired(now) {
            debug!(key, "Durable row past retention");
            self.store.delete(key).await?;
            return Ok(None);
        }

        let payload = match self.decode_payload(&record) {
            Some(payload) => payload,
            None => {
                if let Err(e) = self.store.delete(key).await {
                    warn!(key, "Failed to drop undecodable row: {}", e);
                }
                return Ok(None);
            }
        };
        Ok(Some(CacheEntry {
            key: record.key,
            payload,
            created_at: record.created_at,
            ttl_ms: record.ttl_ms,
            access_count: record.access_count,
            last_accessed: record.last_accessed,
            stale_while_revalidate: record.stale_while_revalidate,
            background_refresh: record.background_refresh,
            encoded: record.encoded,
        }))
    }

    /// Decoded payload, or `None` when neither the codec nor the plain JSON
    /// fallback can read the row. Counts one error on any decode failure.
    fn decode_payload(&self, record: &StoredRecord) -> Option<serde_json::Value> {
        let decoded = self
            .encoder
            .decode(&record.payload, record.codec.as_deref())
            .and_then(|bytes| Ok(serde_json::from_slice::<serde_json::Value>(&bytes)?));

        match decoded {
            Ok(payload) => Some(payload),
            Err(e) => {
                // Uncompacted fallback: rows written before encoding was enabled
                warn!(key = %record.key, "Decoding failed, trying plain payload: {}", e);
                self.analytics.record_error();
                match serde_json::from_slice(&record.payload) {
                    Ok(payload) => Some(payload),
                    Err(_) => {
                        warn!(key = %record.key, "Dropping undecodable durable row");
                        None
                    }
                }
            }
        }
    }

    /// Persist an entry. Returns whether the payload was encoded.
    pub async fn put(&self, entry: &CacheEntry, allow_encoding: bool) -> Result<bool> {
        let json = serde_json::to_vec(&entry.payload)?;
        let stored = self.encoder.encode(&json, allow_encoding);
        let encoded = stored.is_encoded();

        let record = StoredRecord {
            key: entry.key.clone(),
            payload: stored.bytes.to_vec(),
            codec: stored.codec,
            created_at: entry.created_at,
            ttl_ms: entry.ttl_ms,
            retention_ms: self.retention.as_millis() as u64,
            access_count: entry.access_count,
            last_accessed: entry.last_accessed,
            stale_while_revalidate: entry.stale_while_revalidate,
            background_refresh: entry.background_refresh,
            encoded,
        };

        self.store.put(record).await?;
        Ok(encoded)
    }

    /// Delete a row
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete(key).await
    }

    /// Delete every row whose key contains `pattern`
    pub async fn remove_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let matched: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.contains(pattern))
            .collect();

        let mut removed = Vec::with_capacity(matched.len());
        for key in matched {
            match self.store.delete(&key).await {
                Ok(_) => removed.push(key),
                Err(e) => {
                    warn!(key = %key, "Failed to delete matching row: {}", e);
                    self.analytics.record_error();
                }
            }
        }
        Ok(removed)
    }

    /// Delete all rows
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Row count
    pub async fn count(&self) -> Result<usize> {
        self.store.count().await
    }

    /// All keys
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.store.keys().await
    }

    /// Remove rows past retention and abandoned rows, then trim the least
    /// recently accessed rows above `max_entries`.
    pub async fn sweep(&self, now: u64) -> Result<SweepReport> {
        let cutoff = now.saturating_sub(self.retention.as_millis() as u64);
        let mut report = SweepReport::default();

        for key in self.store.created_before(cutoff).await? {
            if self.store.delete(&key).await? {
                report.expired += 1;
            }
        }

        for key in self.store.keys().await? {
            let abandoned = match self.store.get(&key).await? {
                Some(record) => record.is_abandoned(now),
                None => false,
            };
            if abandoned && self.store.delete(&key).await? {
                report.abandoned += 1;
            }
        }

        let count = self.store.count().await?;
        if count > self.max_entries {
            let excess = count - self.max_entries;
            for key in self.store.least_recently_accessed(excess).await? {
                if self.store.delete(&key).await? {
                    report.trimmed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Persist an analytics snapshot
    pub async fn put_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        self.store.put_snapshot(snapshot).await
    }

    /// Read analytics snapshots
    pub async fn snapshots_since(&self, timestamp: u64) -> Result<Vec<AnalyticsSnapshot>> {
        self.store.snapshots_since(timestamp).await
    }

    /// Flush the store
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}

impl std::fmt::Debug for DurableTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTier")
            .field("store", &self.store.name())
            .field("retention", &self.retention)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
