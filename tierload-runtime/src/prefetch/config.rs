//! Configuration for the background prefetch lane.

use std::time::Duration;

/// Configuration for speculative prefetch
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchConfig {
    /// Enable the prefetch lane (default: true)
    pub enabled: bool,

    /// Time between two prefetch loads (default: 2s)
    pub interval: Duration,

    /// Maximum pending prefetch entries (default: 50)
    pub max_queue_size: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self { enabled: true, interval: Duration::from_secs(2), max_queue_size: 50 }
    }
}

impl PrefetchConfig {
    /// Prefetch turned off, entries are never queued
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("TIERLOAD_PREFETCH_ENABLED")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(defaults.enabled),
            interval: std::env::var("TIERLOAD_PREFETCH_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            max_queue_size: std::env::var("TIERLOAD_PREFETCH_MAX_QUEUE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_queue_size),
        }
    }
}
