//! Domain Ports (Port/Adapter Pattern)
//!
//! The cache never reads the wall clock, issues a network request or
//! delivers a notification on its own. It goes through these traits, and
//! the adapters module provides the concrete implementations.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  CacheService                         │
//! │        Clock │ Fetcher │ EventPublisher               │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                     Adapters                          │
//! │  SystemClock │ ManualClock │ HttpFetcher              │
//! │  BroadcastEventPublisher │ LoggingEventPublisher      │
//! └──────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde_json::Value;

use super::events::CacheEvent;
use crate::cache::FetchRequest;
use crate::error::Result;

// =============================================================================
// Clock Port
// =============================================================================

/// Source of the current time in epoch milliseconds.
///
/// All TTL, staleness and queue-delay arithmetic reads time through this
/// trait so tests can advance virtual time deterministically.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time (milliseconds since the Unix epoch)
    fn now_ms(&self) -> u64;
}

// =============================================================================
// Fetcher Port
// =============================================================================

/// Fetch capability supplied by the application.
///
/// Used by preloading, warming and opportunistic background refresh. The
/// cache does not retry; retry and backoff belong to the implementation.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the resource described by `request`
    async fn fetch(&self, request: &FetchRequest) -> Result<Value>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Delivery of cache events to whoever owns the cached resources.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event
    async fn publish(&self, event: CacheEvent) -> Result<()>;

    /// Publish a batch of events in order
    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
