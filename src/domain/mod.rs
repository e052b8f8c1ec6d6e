//! Domain Layer
//!
//! Ports the cache depends on and the events it emits.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for time, fetching and event delivery
//! - **Events** (`events.rs`) - Cache events for observers and refresh owners
//!
//! # Usage
//!
//! ```ignore
//! use couchecache::domain::ports::{Clock, Fetcher};
//!
//! async fn refetch<F: Fetcher>(fetcher: &F, request: &FetchRequest) -> Result<Value> {
//!     fetcher.fetch(request).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::CacheEvent;
pub use ports::{Clock, EventPublisher, Fetcher};
