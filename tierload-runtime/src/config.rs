//! Loader configuration.

use std::time::Duration;
use tierload_core::{CacheConfig, RetryPolicy, TierTable};

use crate::prefetch::PrefetchConfig;

/// Everything a [`ProgressiveLoader`](crate::ProgressiveLoader) needs to know
/// about tiers, caching, retries and prefetch.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// Per-tier batch size, delay and proximity threshold
    pub tiers: TierTable,

    pub cache: CacheConfig,

    pub retry: RetryPolicy,

    pub prefetch: PrefetchConfig,

    /// Upper bound for a single loader invocation (default: none).
    /// An expired load counts as a transient failure.
    pub load_timeout: Option<Duration>,
}

impl LoaderConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            tiers: TierTable::default(),
            cache: CacheConfig::from_env(),
            retry: RetryPolicy::from_env(),
            prefetch: PrefetchConfig::from_env(),
            load_timeout: std::env::var("TIERLOAD_LOAD_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis),
        }
    }

    pub fn with_tiers(mut self, tiers: TierTable) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }
}
