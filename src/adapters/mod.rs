//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │          Clock │ Fetcher │ EventPublisher                   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ SystemClock │ ManualClock │ HttpFetcher                    │ │
//! │  │ Broadcast/Logging/InMemory/Composite EventPublisher        │ │
//! │  │ PrometheusExporter                                         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod clock;
mod event_publisher;
mod http_fetcher;
mod prometheus;

pub use clock::{ManualClock, SystemClock};
pub use event_publisher::{
    BroadcastEventPublisher, CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher,
    DEFAULT_EVENT_CAPACITY,
};
pub use http_fetcher::{HttpFetcher, DEFAULT_FETCH_TIMEOUT};
pub use self::prometheus::PrometheusExporter;
