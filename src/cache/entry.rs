//! Cache Entry Types
//!
//! The storage unit shared by both tiers, the canonical key builder, and the
//! per-call options for reads and writes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::duration_ms;

/// Build a canonical cache key from a resource path and request parameters.
///
/// Parameters are sorted by name and joined as `k=v&k=v`, so differently
/// ordered but identical parameter sets collapse to one key. String values
/// are rendered without JSON quoting. With no parameters the path is
/// returned unchanged.
pub fn generate_key<I, K, V>(resource_path: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<Value>,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), render_param(&v.into())))
        .collect();

    if pairs.is_empty() {
        return resource_path.to_string();
    }

    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", resource_path, query)
}

pub(crate) fn render_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Options for a cache read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Serve stale durable values while queueing a refresh.
    /// `None` uses the service-wide default.
    pub use_stale_while_revalidate: Option<bool>,
    /// Skip the cache entirely; the caller is about to refetch
    pub force_refresh: bool,
}

impl GetOptions {
    /// Read that bypasses the cache
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            ..Default::default()
        }
    }
}

/// Options for a cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetOptions {
    /// Opt this entry into stale-while-revalidate
    pub stale_while_revalidate: bool,
    /// Ask for proactive revalidation once the TTL elapses
    pub background_refresh: bool,
    /// Allow the encoding layer to compact the durable copy
    pub compress: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            stale_while_revalidate: false,
            background_refresh: false,
            compress: true,
        }
    }
}

/// Description of a request the cache may fetch on the caller's behalf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Resource path or URL
    pub url: String,
    /// Query parameters
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// TTL for the cached result (service default when absent)
    #[serde(default, with = "duration_ms::option")]
    pub ttl: Option<Duration>,
    /// Write options for the cached result
    #[serde(default)]
    pub options: SetOptions,
}

impl FetchRequest {
    /// Create a request with no parameters
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: BTreeMap::new(),
            ttl: None,
            options: SetOptions::default(),
        }
    }

    /// Add a query parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Set the TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set write options
    pub fn with_options(mut self, options: SetOptions) -> Self {
        self.options = options;
        self
    }

    /// Canonical cache key for this request
    pub fn cache_key(&self) -> String {
        generate_key(&self.url, self.params.iter().map(|(k, v)| (k, v.clone())))
    }
}

/// Cache entry: payload plus freshness and access metadata
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Canonical key
    pub key: String,
    /// Cached value
    pub payload: Value,
    /// Creation/refresh time (epoch ms)
    pub created_at: u64,
    /// Validity window in milliseconds
    pub ttl_ms: u64,
    /// Number of hits plus the initial write
    pub access_count: u64,
    /// Last hit time (epoch ms)
    pub last_accessed: u64,
    /// Stale-while-revalidate opt-in
    pub stale_while_revalidate: bool,
    /// Proactive revalidation requested
    pub background_refresh: bool,
    /// Durable copy went through the encoding layer
    pub encoded: bool,
}

impl CacheEntry {
    /// Create a new entry at `now`
    pub fn new(key: impl Into<String>, payload: Value, ttl: Duration, now: u64) -> Self {
        Self {
            key: key.into(),
            payload,
            created_at: now,
            ttl_ms: ttl.as_millis() as u64,
            access_count: 1,
            last_accessed: now,
            stale_while_revalidate: false,
            background_refresh: false,
            encoded: false,
        }
    }

    /// Apply write options
    pub fn with_options(mut self, options: &SetOptions) -> Self {
        self.stale_while_revalidate = options.stale_while_revalidate;
        self.background_refresh = options.background_refresh;
        self
    }

    /// Milliseconds since creation
    #[inline]
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// `now - created_at > ttl`
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.age(now) > self.ttl_ms
    }

    /// Record a hit and return the new access count
    #[inline]
    pub fn record_access(&mut self, now: u64) -> u64 {
        self.last_accessed = now;
        self.access_count += 1;
        self.access_count
    }

    /// TTL as a `Duration`
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_generate_key_sorts_params() {
        let a = generate_key("/api/tasks", [("page", 1), ("limit", 10)]);
        let b = generate_key("/api/tasks", [("limit", 10), ("page", 1)]);
        assert_eq!(a, b);
        assert_eq!(a, "/api/tasks?limit=10&page=1");
    }

    #[test]
    fn test_generate_key_without_params() {
        let params: [(&str, i64); 0] = [];
        assert_eq!(generate_key("/api/users", params), "/api/users");
    }

    #[test]
    fn test_generate_key_renders_strings_unquoted() {
        let key = generate_key(
            "/api/search",
            [("q", json!("rust")), ("strict", json!(true))],
        );
        assert_eq!(key, "/api/search?q=rust&strict=true");
    }

    #[test]
    fn test_fetch_request_cache_key() {
        let request = FetchRequest::new("/api/tasks")
            .param("page", 2)
            .param("status", "open");
        assert_eq!(request.cache_key(), "/api/tasks?page=2&status=open");
    }

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_millis(100), 1_000);
        assert!(!entry.is_expired(1_100));
        assert!(entry.is_expired(1_101));
    }

    #[test]
    fn test_entry_access_tracking() {
        let mut entry = CacheEntry::new("k", json!("v"), Duration::from_secs(1), 0);
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.record_access(50), 2);
        assert_eq!(entry.last_accessed, 50);
    }

    #[test]
    fn test_entry_with_options() {
        let options = SetOptions {
            stale_while_revalidate: true,
            background_refresh: true,
            compress: false,
        };
        let entry = CacheEntry::new("k", json!(null), Duration::from_secs(1), 0).with_options(&options);
        assert!(entry.stale_while_revalidate);
        assert!(entry.background_refresh);
        assert!(!entry.encoded);
    }

    #[test]
    fn test_clock_skew_never_underflows() {
        let entry = CacheEntry::new("k", json!(1), Duration::from_millis(10), 5_000);
        assert_eq!(entry.age(4_000), 0);
        assert!(!entry.is_expired(4_000));
    }

    proptest! {
        #[test]
        fn prop_key_is_order_independent(
            params in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 0..6)
        ) {
            let forward: Vec<(String, i64)> = params.clone().into_iter().collect();
            let mut reversed = forward.clone();
            reversed.reverse();

            prop_assert_eq!(
                generate_key("/api/r", forward),
                generate_key("/api/r", reversed)
            );
        }
    }
}
