//! Metrics for the prefetch lane.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for monitoring prefetch performance
#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    /// Regions queued for prefetch
    pub queued: AtomicU64,

    /// Regions not queued because the queue was full
    pub dropped: AtomicU64,

    /// Entries popped but not loaded (gone, relevant, cached or in flight)
    pub skipped: AtomicU64,

    /// Prefetch loads started
    pub executed: AtomicU64,

    /// Prefetch loads that warmed the cache
    pub succeeded: AtomicU64,

    /// Prefetch loads that failed
    pub failed: AtomicU64,
}

impl PrefetchMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> PrefetchStats {
        let queued = self.queued.load(Ordering::Relaxed);
        let executed = self.executed.load(Ordering::Relaxed);

        PrefetchStats {
            queued,
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            executed,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            execution_rate: if queued > 0 { executed as f64 / queued as f64 } else { 0.0 },
        }
    }
}

/// Snapshot of prefetch statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrefetchStats {
    pub queued: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Share of queued entries that were actually loaded
    pub execution_rate: f64,
}
