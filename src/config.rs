//! Cache Configuration
//!
//! One `CacheConfig` aggregates the per-component sections. Every section
//! has working defaults; a YAML file may override any subset, and a few
//! environment variables override the file.
//!
//! ```yaml
//! cache:
//!   default_ttl: 300000        # milliseconds
//!   stale_while_revalidate: true
//! memory:
//!   max_entries: 200
//! durable:
//!   backend: sled
//!   path: /var/lib/couchecache
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::compression::EncodingConfig;
use crate::cache::memory::MemoryConfig;
use crate::error::{Error, Result};

/// Serde helpers for durations written as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
        }
    }
}

/// Read/write behaviour shared by all tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// TTL applied when `set` is called without one
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Service-wide stale-while-revalidate default for reads
    pub stale_while_revalidate: bool,
    /// How far past its TTL a durable value must be before a refresh is queued
    #[serde(with = "duration_ms")]
    pub stale_grace: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            stale_while_revalidate: true,
            stale_grace: Duration::from_secs(60),
        }
    }
}

/// Durable tier backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// On-disk sled database
    Sled,
    /// Process memory (tests, ephemeral sessions)
    Memory,
    /// No durable tier
    Disabled,
}

/// Durable tier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    /// Backend
    pub backend: StorageBackend,
    /// Database directory (sled)
    pub path: PathBuf,
    /// Delete the database when the store is dropped
    pub temporary: bool,
    /// Row retention, independent of entry TTLs
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    /// Row bound enforced by the durable sweep
    pub max_entries: usize,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            path: PathBuf::from("couchecache.db"),
            temporary: false,
            retention: Duration::from_secs(24 * 60 * 60),
            max_entries: 5000,
        }
    }
}

/// Deferred-work queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum time a refresh item waits before it drains
    #[serde(with = "duration_ms")]
    pub refresh_delay: Duration,
    /// Minimum time a warming item waits before it drains
    #[serde(with = "duration_ms")]
    pub warming_delay: Duration,
    /// Per-queue item bound
    pub max_items: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            refresh_delay: Duration::from_secs(5),
            warming_delay: Duration::from_secs(2),
            max_items: 500,
        }
    }
}

/// Analytics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Persist periodic snapshots to the durable tier
    pub persist_snapshots: bool,
    /// Snapshot interval
    #[serde(with = "duration_ms")]
    pub snapshot_interval: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            persist_snapshots: true,
            snapshot_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Background timer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Start timers in `init`
    pub enabled: bool,
    /// Fast tier expiry sweep
    #[serde(with = "duration_ms")]
    pub expiry_sweep_interval: Duration,
    /// Background refresh queue drain
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
    /// Warming queue drain
    #[serde(with = "duration_ms")]
    pub warming_interval: Duration,
    /// Durable tier sweep
    #[serde(with = "duration_ms")]
    pub durable_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry_sweep_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(10),
            warming_interval: Duration::from_secs(5),
            durable_sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Complete cache configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache: GeneralConfig,
    pub memory: MemoryConfig,
    pub durable: DurableConfig,
    pub encoding: EncodingConfig,
    pub queues: QueueConfig,
    pub analytics: AnalyticsConfig,
    pub scheduler: SchedulerConfig,
}

impl CacheConfig {
    /// Memory-backed durable tier, no timers. Used by tests and demos.
    pub fn ephemeral() -> Self {
        Self {
            durable: DurableConfig {
                backend: StorageBackend::Memory,
                temporary: true,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `COUCHECACHE_*` environment overrides
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(path) = std::env::var("COUCHECACHE_DB_PATH") {
            self.durable.path = PathBuf::from(path);
        }
        if let Some(max) = env_parse::<usize>("COUCHECACHE_MEMORY_MAX_ENTRIES")? {
            self.memory.max_entries = max;
        }
        if let Some(ttl) = env_parse::<u64>("COUCHECACHE_DEFAULT_TTL_MS")? {
            self.cache.default_ttl = Duration::from_millis(ttl);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations the tiers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory.max_entries == 0 {
            return Err(Error::Config("memory.max_entries must be at least 1".into()));
        }
        if self.queues.max_items == 0 {
            return Err(Error::Config("queues.max_items must be at least 1".into()));
        }
        if self.durable.backend != StorageBackend::Disabled && self.durable.max_entries == 0 {
            return Err(Error::Config("durable.max_entries must be at least 1".into()));
        }
        if self.durable.retention < self.cache.default_ttl {
            return Err(Error::Config(
                "durable.retention must not be shorter than cache.default_ttl".into(),
            ));
        }
        let intervals = [
            self.scheduler.expiry_sweep_interval,
            self.scheduler.refresh_interval,
            self.scheduler.warming_interval,
            self.scheduler.durable_sweep_interval,
            self.analytics.snapshot_interval,
        ];
        if self.scheduler.enabled && intervals.iter().any(|d| d.is_zero()) {
            return Err(Error::Config("scheduler intervals must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a valid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
