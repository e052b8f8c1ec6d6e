//! Layered Response Cache
//!
//! A fast in-memory tier in front of a durable on-device tier, with
//! stale-while-revalidate reads, deferred background refresh, cache warming
//! and payload compaction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          CacheService                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  get ─► Memory Tier ─► Durable Tier ─► miss (caller fetches + set)   │
//! │           │                 │                                        │
//! │   LRU, entry count     sled / memory store, retention sweep          │
//! │   lazy TTL expiry      LZ4 above threshold, promotion on hit         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Refresh Queue │ Warming Queue │ Analytics │ Timers (interval loops) │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use couchecache::cache::{generate_key, CacheService, GetOptions, SetOptions};
//! use couchecache::config::CacheConfig;
//! use serde_json::json;
//!
//! # async fn example() -> couchecache::Result<()> {
//! let cache = Arc::new(CacheService::builder(CacheConfig::ephemeral()).build()?);
//! cache.init().await;
//!
//! let key = generate_key("/api/tasks", [("page", 1)]);
//! if cache.get(&key, GetOptions::default()).await.is_none() {
//!     cache.set(&key, json!([{"id": 1}]), None, SetOptions::default()).await;
//! }
//!
//! cache.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod compression;
pub mod durable;
pub mod entry;
pub mod memory;
pub mod policy;
pub mod queue;
pub mod service;
pub mod sled_store;
pub mod tiered;

pub use analytics::{AnalyticsCounters, AnalyticsSnapshot, CacheAnalytics};
pub use compression::{Codec, IdentityCodec, Lz4Codec, PayloadEncoder};
pub use durable::{DurableStore, DurableTier, InMemoryStore, StoredRecord, SweepReport};
pub use entry::{generate_key, CacheEntry, FetchRequest, GetOptions, SetOptions};
pub use memory::MemoryTier;
pub use policy::RevalidationPolicy;
pub use service::{CacheService, CacheServiceBuilder, CacheStats};
pub use sled_store::SledStore;
pub use tiered::{Tier, TierKind, TieredCache};

/// Default memory tier capacity (entries)
pub const DEFAULT_MEMORY_MAX_ENTRIES: usize = 200;
