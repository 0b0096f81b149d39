//! Prometheus export of loader metrics
//!
//! Each exporter owns its registry, so several loaders in one process report
//! independently. Counters are brought up to date from a [`MetricsSnapshot`]
//! before encoding.

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use super::MetricsSnapshot;

const NAMESPACE: &str = "tierload";

/// Renders loader metrics in Prometheus text format
pub struct PrometheusExporter {
    registry: Registry,
    invocations: IntCounter,
    loads: IntCounterVec,
    cache_lookups: IntCounterVec,
    retries: IntCounter,
    render_errors: IntCounter,
    timeouts: IntCounter,
    prefetch: IntCounterVec,
    latency_ms: Gauge,
    tier_regions: IntGaugeVec,
}

impl PrometheusExporter {
    /// Create an exporter with all metrics registered
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let invocations = IntCounter::with_opts(
            Opts::new("loader_invocations_total", "Loader invocations, prefetch included").namespace(NAMESPACE),
        )?;
        let loads = IntCounterVec::new(
            Opts::new("loads_total", "Load outcomes").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups on relevance").namespace(NAMESPACE),
            &["result"],
        )?;
        let retries = IntCounter::with_opts(
            Opts::new("retries_scheduled_total", "Automatic retries scheduled").namespace(NAMESPACE),
        )?;
        let render_errors = IntCounter::with_opts(
            Opts::new("render_errors_total", "Payloads the renderer rejected").namespace(NAMESPACE),
        )?;
        let timeouts = IntCounter::with_opts(
            Opts::new("load_timeouts_total", "Loader invocations cut off by the timeout").namespace(NAMESPACE),
        )?;
        let prefetch = IntCounterVec::new(
            Opts::new("prefetch_total", "Prefetch lane events").namespace(NAMESPACE),
            &["event"],
        )?;
        let latency_ms = Gauge::with_opts(
            Opts::new("load_latency_avg_ms", "Average loader latency in milliseconds").namespace(NAMESPACE),
        )?;
        let tier_regions = IntGaugeVec::new(
            Opts::new("tier_regions", "Regions per tier and scheduling state").namespace(NAMESPACE),
            &["tier", "state"],
        )?;

        registry.register(Box::new(invocations.clone()))?;
        registry.register(Box::new(loads.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(render_errors.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(prefetch.clone()))?;
        registry.register(Box::new(latency_ms.clone()))?;
        registry.register(Box::new(tier_regions.clone()))?;

        Ok(Self {
            registry,
            invocations,
            loads,
            cache_lookups,
            retries,
            render_errors,
            timeouts,
            prefetch,
            latency_ms,
            tier_regions,
        })
    }

    /// Bring every metric in line with the snapshot
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        advance(&self.invocations, snapshot.total_requests);
        advance(&self.loads.with_label_values(&["success"]), snapshot.successful_loads);
        advance(&self.loads.with_label_values(&["failure"]), snapshot.failed_loads);
        advance(&self.loads.with_label_values(&["unsupported"]), snapshot.unsupported);
        advance(&self.cache_lookups.with_label_values(&["hit"]), snapshot.cache_hits);
        advance(&self.cache_lookups.with_label_values(&["miss"]), snapshot.cache_misses);
        advance(&self.cache_lookups.with_label_values(&["dedup"]), snapshot.dedup_joins);
        advance(&self.retries, snapshot.retries_scheduled);
        advance(&self.render_errors, snapshot.render_errors);
        advance(&self.timeouts, snapshot.timeouts);

        let prefetch = &snapshot.prefetch;
        for (event, value) in [
            ("queued", prefetch.queued),
            ("dropped", prefetch.dropped),
            ("skipped", prefetch.skipped),
            ("executed", prefetch.executed),
            ("succeeded", prefetch.succeeded),
            ("failed", prefetch.failed),
        ] {
            advance(&self.prefetch.with_label_values(&[event]), value);
        }

        self.latency_ms.set(snapshot.avg_latency_ms);

        for (tier, load) in &snapshot.tiers {
            self.tier_regions
                .with_label_values(&[tier.as_str(), "queued"])
                .set(load.queued as i64);
            self.tier_regions
                .with_label_values(&[tier.as_str(), "loading"])
                .set(load.loading as i64);
        }
    }

    /// Update from the snapshot and encode everything in text format
    pub fn render(&self, snapshot: &MetricsSnapshot) -> String {
        self.update(snapshot);
        self.encode()
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
    }
}

/// Counters only move forward; a snapshot below the counter is ignored
fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}
