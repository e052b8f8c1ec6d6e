//! CoucheCache - Layered Client-Side Response Cache
//!
//! Sits between an application's data layer and its network backend. Reads
//! are served from a bounded in-memory tier, then from a persistent on-device
//! tier that survives restarts; on a total miss the caller fetches and
//! stores the result.
//!
//! # Features
//!
//! - Memory tier with LRU eviction and lazy TTL expiry
//! - Durable tier on sled with retention, capacity trim and indices
//! - Stale-while-revalidate with a deferred background refresh queue
//! - Cache warming and concurrent preloading through a pluggable fetcher
//! - LZ4 compaction of large payloads
//! - Cache-health analytics with daily persisted snapshots
//!
//! # Modules
//!
//! - [`adapters`] - Clock, fetcher, event and metrics adapters
//! - [`cache`] - Tiers, queues, analytics and the `CacheService`
//! - [`config`] - Configuration loading and validation
//! - [`domain`] - Ports and events
//! - [`error`] - Error types

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use cache::{generate_key, CacheService, CacheStats, FetchRequest, GetOptions, SetOptions};
pub use config::CacheConfig;
pub use error::{Error, Result};
