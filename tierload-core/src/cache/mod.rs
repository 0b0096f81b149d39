//! TTL cache for loaded payloads.
//!
//! ```text
//!  relevant(region)
//!        │
//!        ▼
//! ┌──────────────┐  live entry   ┌──────────┐
//! │  CacheStore  │ ────────────► │  render  │
//! │ (TTL, FIFO)  │               └──────────┘
//! └──────┬───────┘
//!        │ miss / stale (entry dropped)
//!        ▼
//!   queue for load ──► set(key, payload, ttl)
//! ```
//!
//! Expiry is lazy: a stale entry is only removed when it is read (or when
//! [`CacheStore::purge_expired`] runs). Size is bounded by `max_entries`; by
//! default the oldest insertion goes first, see [`EvictionPolicy`].

mod config;
mod metrics;
mod store;

pub use config::{CacheConfig, EvictionPolicy};
pub use metrics::{CacheMetrics, CacheStats};
pub use store::{CacheEntry, CacheStore};
