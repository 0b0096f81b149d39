//! Loader metrics.
//!
//! Counters are plain atomics updated by the scheduler; reading them never
//! takes the scheduler lock and never influences scheduling.

mod prometheus;

pub use self::prometheus::PrometheusExporter;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tierload_core::{CacheStats, Tier};

use crate::prefetch::PrefetchStats;
use crate::scheduler::TierLoad;

/// Counters for monitoring loader behavior
#[derive(Debug, Default)]
pub struct LoaderMetrics {
    /// Loader invocations, prefetch included
    pub total_requests: AtomicU64,

    /// Invocations that resolved
    pub successful_loads: AtomicU64,

    /// Regions that ended in a failed state because of load errors or unsupported content
    pub failed_loads: AtomicU64,

    /// Regions whose content type had no loader
    pub unsupported: AtomicU64,

    pub cache_hits: AtomicU64,

    pub cache_misses: AtomicU64,

    /// Regions attached to a load already in flight
    pub dedup_joins: AtomicU64,

    pub retries_scheduled: AtomicU64,

    pub render_errors: AtomicU64,

    /// Invocations cut off by the load timeout
    pub timeouts: AtomicU64,

    /// Invocations that settled either way (for averaging)
    pub settled_loads: AtomicU64,

    /// Total loader latency in microseconds (for averaging)
    pub total_latency_us: AtomicU64,
}

impl LoaderMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settled invocation and its latency
    pub fn record_settled(&self, success: bool, latency: Duration) {
        if success {
            self.successful_loads.fetch_add(1, Ordering::Relaxed);
        }
        self.settled_loads.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failed_region(&self) {
        self.failed_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::Relaxed);
        self.failed_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_render_error(&self) {
        self.render_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Average latency of settled invocations in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        let settled = self.settled_loads.load(Ordering::Relaxed);
        if settled == 0 {
            return 0.0;
        }
        self.total_latency_us.load(Ordering::Relaxed) as f64 / settled as f64 / 1000.0
    }

    /// Get a snapshot combined with cache, prefetch and tier figures
    pub fn snapshot(
        &self,
        cache: CacheStats,
        prefetch: PrefetchStats,
        tiers: BTreeMap<Tier, TierLoad>,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_loads: self.successful_loads.load(Ordering::Relaxed),
            failed_loads: self.failed_loads.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            render_errors: self.render_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
            cache,
            prefetch,
            tiers,
        }
    }
}

/// Snapshot of loader statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_loads: u64,
    pub failed_loads: u64,
    pub unsupported: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub dedup_joins: u64,
    pub retries_scheduled: u64,
    pub render_errors: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
    pub cache: CacheStats,
    pub prefetch: PrefetchStats,
    /// Queued and loading regions per tier at snapshot time
    pub tiers: BTreeMap<Tier, TierLoad>,
}

impl MetricsSnapshot {
    /// Share of relevance lookups served from cache
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}
