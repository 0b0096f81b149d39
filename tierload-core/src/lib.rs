// tierload core library
//
// Synchronous building blocks of the progressive loader: tier table, TTL cache,
// retry policy and the region lifecycle model. Nothing here performs I/O.

pub mod cache;
pub mod clock;
pub mod error;
pub mod region;
pub mod retry;
pub mod tier;

pub use cache::{CacheConfig, CacheEntry, CacheStats, CacheStore, EvictionPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigurationError, LoadError, LoaderError, RenderError};
pub use region::{derive_cache_key, Payload, RegionFailure, RegionState, GENERIC_SKELETON};
pub use retry::{RetryDecision, RetryManager, RetryPolicy, RetryState};
pub use tier::{Tier, TierConfig, TierTable};
