//! Configuration for the cache store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigurationError;

/// Which entry goes first when the store is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Oldest insertion is evicted, reads do not refresh an entry
    #[default]
    InsertionOrder,
    /// Least recently read entry is evicted
    AccessOrder,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::InsertionOrder => f.write_str("insertion"),
            EvictionPolicy::AccessOrder => f.write_str("access"),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insertion" | "insertion_order" | "fifo" => Ok(EvictionPolicy::InsertionOrder),
            "access" | "access_order" | "lru" => Ok(EvictionPolicy::AccessOrder),
            other => Err(ConfigurationError::UnknownEvictionPolicy(other.to_string())),
        }
    }
}

/// Configuration for the cache store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in
    pub max_entries: usize,

    /// TTL used when a loader does not declare one
    pub default_ttl: Duration,

    /// Eviction order once `max_entries` is exceeded
    pub eviction: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            default_ttl: Duration::from_secs(300), // 5 minutes
            eviction: EvictionPolicy::InsertionOrder,
        }
    }
}

impl CacheConfig {
    /// Small cache for constrained clients
    pub fn low_memory() -> Self {
        Self {
            max_entries: 50,
            default_ttl: Duration::from_secs(120),
            eviction: EvictionPolicy::InsertionOrder,
        }
    }

    /// Large, access-ordered cache for pages that revisit the same content
    pub fn high_hit_rate() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(900),
            eviction: EvictionPolicy::AccessOrder,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TIERLOAD_CACHE_MAX_ENTRIES") {
            if let Ok(n) = val.parse() {
                config.max_entries = n;
            }
        }

        if let Ok(val) = std::env::var("TIERLOAD_CACHE_TTL_SECS") {
            if let Ok(n) = val.parse() {
                config.default_ttl = Duration::from_secs(n);
            }
        }

        if let Ok(val) = std::env::var("TIERLOAD_CACHE_EVICTION") {
            match val.parse() {
                Ok(policy) => config.eviction = policy,
                Err(e) => tracing::warn!("Ignoring TIERLOAD_CACHE_EVICTION: {}", e),
            }
        }

        config
    }
}
