//! Region scheduler.
//!
//! Owns every piece of mutable loader state: region records, tier queues, the
//! in-flight map, retry bookkeeping, the cache and the prefetch queue. Each
//! public method is one synchronous transition that returns the [`Effect`]s
//! to run once the caller has released its lock.
//!
//! # Region lifecycle
//!
//! ```text
//! register ─► Skeleton ──relevant──► cache hit ─────────────────► Rendered
//!                           │
//!                           └─► Queued ─► Loading ─► ok ─────────► Rendered
//!                                 ▲          │
//!                                 │          └─► error ─► RetryWait
//!                                 └──────── backoff ◄──────┘   │
//!                                                              └─► Failed
//! ```
//!
//! # Deduplication
//!
//! Loads are keyed by cache key. A region admitted while a load for its key is
//! in flight becomes an extra waiter of that load instead of invoking the
//! loader again; it still holds a slot of its own tier until the load settles.

mod effect;
mod queue;

pub(crate) use effect::{Effect, Lane, LoadJob};
pub use queue::TierLoad;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierload_core::{
    CacheStats, CacheStore, Clock, ConfigurationError, LoadError, LoaderError, Payload, RegionFailure,
    RegionState, RenderError, RetryDecision, RetryManager, Tier,
};
use tracing::{debug, error, trace, warn};

use self::queue::{Admission, TierQueue};
use crate::config::LoaderConfig;
use crate::metrics::LoaderMetrics;
use crate::prefetch::{PrefetchMetrics, PrefetchQueue};
use crate::registry::{ContentLoader, LoadOutput, RegionContext, SkeletonId};

/// A region as registered by the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRegistration {
    pub region_id: String,
    pub content_type: String,
    pub tier: Tier,
    /// Identity for caching and deduplication
    pub cache_key: String,
    /// Load ahead of need through the prefetch lane
    pub prefetch: bool,
    /// Passed through to the loader
    pub params: serde_json::Value,
}

struct RegionRecord {
    registration: ContentRegistration,
    skeleton: SkeletonId,
    /// `None` when the content type has no loader
    loader: Option<Arc<dyn ContentLoader>>,
    state: RegionState,
    generation: u64,
}

impl RegionRecord {
    fn context(&self) -> RegionContext {
        RegionContext {
            region_id: self.registration.region_id.clone(),
            content_type: self.registration.content_type.clone(),
            params: self.registration.params.clone(),
        }
    }
}

/// A region waiting on an in-flight load
#[derive(Debug, Clone)]
struct Waiter {
    region_id: String,
    generation: u64,
    tier: Tier,
}

struct InFlight {
    waiters: Vec<Waiter>,
    lane: Lane,
}

/// Time base for batch spacing, follows tokio's clock so paused tests stay exact
fn timer_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct Scheduler {
    queues: Vec<TierQueue>,
    regions: HashMap<String, RegionRecord>,
    in_flight: HashMap<String, InFlight>,
    retries: RetryManager,
    cache: CacheStore<Payload>,
    default_ttl: Duration,
    prefetch: PrefetchQueue,
    prefetch_enabled: bool,
    prefetch_running: bool,
    next_generation: u64,
    metrics: Arc<LoaderMetrics>,
    prefetch_metrics: Arc<PrefetchMetrics>,
}

impl Scheduler {
    pub fn new(
        config: &LoaderConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<LoaderMetrics>,
        prefetch_metrics: Arc<PrefetchMetrics>,
    ) -> Self {
        Self {
            queues: config.tiers.iter().map(|(tier, tc)| TierQueue::new(tier, *tc)).collect(),
            regions: HashMap::new(),
            in_flight: HashMap::new(),
            retries: RetryManager::new(config.retry.clone()),
            cache: CacheStore::new(&config.cache, clock),
            default_ttl: config.cache.default_ttl,
            prefetch: PrefetchQueue::new(config.prefetch.max_queue_size),
            prefetch_enabled: config.prefetch.enabled,
            prefetch_running: false,
            next_generation: 0,
            metrics,
            prefetch_metrics,
        }
    }

    fn queue_mut(&mut self, tier: Tier) -> &mut TierQueue {
        &mut self.queues[tier.index()]
    }

    // ---- registration ------------------------------------------------------

    /// Register (or re-register) a region. The skeleton effect always comes first.
    pub fn register(
        &mut self,
        registration: ContentRegistration,
        loader: Result<Arc<dyn ContentLoader>, ConfigurationError>,
        skeleton: SkeletonId,
    ) -> Vec<Effect> {
        let region_id = registration.region_id.clone();
        let mut effects = self.unregister(&region_id);

        self.next_generation += 1;
        let generation = self.next_generation;

        effects.push(Effect::ShowSkeleton { region_id: region_id.clone(), skeleton: skeleton.clone() });

        let (state, loader) = match loader {
            Ok(loader) => {
                debug!(
                    region = %region_id,
                    tier = %registration.tier,
                    key = %registration.cache_key,
                    "Region registered"
                );
                if registration.prefetch {
                    self.enqueue_prefetch(&region_id);
                }
                effects.push(Effect::Observe { region_id: region_id.clone(), tier: registration.tier, generation });
                (RegionState::Skeleton, Some(loader))
            }
            Err(err) => {
                error!(region = %region_id, error = %err, "Region cannot be loaded");
                self.metrics.record_unsupported();
                let failure = RegionFailure::Unsupported { content_type: registration.content_type.clone() };
                effects.push(Effect::HideSkeleton { region_id: region_id.clone() });
                effects.push(Effect::ShowError { region_id: region_id.clone(), failure: failure.clone() });
                (RegionState::Failed(failure), None)
            }
        };

        self.regions.insert(
            region_id,
            RegionRecord { registration, skeleton, loader, state, generation },
        );
        effects
    }

    /// Drop a region. A load it waits on keeps running but will not render it.
    pub fn unregister(&mut self, region_id: &str) -> Vec<Effect> {
        let Some(record) = self.regions.remove(region_id) else {
            return Vec::new();
        };

        self.retries.clear(region_id);
        self.prefetch.remove(region_id);
        if record.state == RegionState::Queued {
            self.queue_mut(record.registration.tier).remove(region_id);
        }

        debug!(region = %region_id, state = %record.state, "Region unregistered");
        vec![Effect::Unobserve { region_id: region_id.to_string() }]
    }

    fn enqueue_prefetch(&mut self, region_id: &str) {
        if !self.prefetch_enabled {
            return;
        }
        if self.prefetch.push(region_id) {
            self.prefetch_metrics.record_queued();
            trace!(region = %region_id, "Queued for prefetch");
        } else {
            self.prefetch_metrics.record_dropped();
            debug!(region = %region_id, "Prefetch entry dropped (queue full)");
        }
    }

    // ---- relevance and admission -------------------------------------------

    /// A region came within range of the viewport.
    ///
    /// Events observed for an earlier registration of the same id are ignored.
    pub fn on_relevant(&mut self, region_id: &str, tier: Tier, generation: u64) -> Vec<Effect> {
        let Some(record) = self.regions.get(region_id) else {
            trace!(region = %region_id, "Relevance event for unknown region");
            return Vec::new();
        };
        if record.generation != generation {
            trace!(region = %region_id, generation, "Stale relevance event");
            return Vec::new();
        }
        if record.state != RegionState::Skeleton || record.registration.tier != tier {
            return Vec::new();
        }

        let key = record.registration.cache_key.clone();
        if let Some(entry) = self.cache.get(&key) {
            self.metrics.record_cache_hit();
            debug!(region = %region_id, key = %key, "Cache hit");
            return self.render_region(region_id, entry.payload);
        }

        self.metrics.record_cache_miss();
        self.enqueue(region_id, tier)
    }

    /// Put a region in its tier queue, or straight through when nobody waits
    fn enqueue(&mut self, region_id: &str, tier: Tier) -> Vec<Effect> {
        if let Some(record) = self.regions.get_mut(region_id) {
            record.state = RegionState::Queued;
        }

        let queue = self.queue_mut(tier);
        if queue.accepts_immediately() {
            queue.mark_admission(timer_now());
            return self.admit(region_id, tier);
        }

        queue.push_back(region_id);
        debug!(region = %region_id, tier = %tier, queued = queue.load().queued, "Region queued");
        self.pump(tier)
    }

    /// Admit waiting regions of a tier if slots and batch spacing allow
    fn pump(&mut self, tier: Tier) -> Vec<Effect> {
        match self.queue_mut(tier).poll_admission(timer_now()) {
            Admission::Idle => Vec::new(),
            Admission::WaitFor(delay) => {
                trace!(tier = %tier, delay_ms = delay.as_millis() as u64, "Next batch delayed");
                vec![Effect::WakeTier { tier, delay }]
            }
            Admission::Open => {
                let mut effects = Vec::new();
                while let Some(region_id) = self.queue_mut(tier).pop_admissible() {
                    effects.extend(self.admit(&region_id, tier));
                }
                effects
            }
        }
    }

    /// Wake timer of a tier fired
    pub fn on_tier_wake(&mut self, tier: Tier) -> Vec<Effect> {
        self.queue_mut(tier).wake();
        self.pump(tier)
    }

    /// Move a queued region to loading: re-check the cache, then join or start a load
    fn admit(&mut self, region_id: &str, tier: Tier) -> Vec<Effect> {
        let Some(record) = self.regions.get(region_id) else {
            return Vec::new();
        };
        if record.state != RegionState::Queued {
            return Vec::new();
        }
        let Some(loader) = record.loader.clone() else {
            return Vec::new();
        };

        let key = record.registration.cache_key.clone();
        let context = record.context();
        let waiter = Waiter { region_id: region_id.to_string(), generation: record.generation, tier };

        if self.cache.contains(&key) {
            if let Some(entry) = self.cache.get(&key) {
                debug!(region = %region_id, key = %key, "Cache warmed while queued");
                return self.render_region(region_id, entry.payload);
            }
        }

        self.queue_mut(tier).acquire_slot();
        if let Some(record) = self.regions.get_mut(region_id) {
            record.state = RegionState::Loading;
        }

        if let Some(flight) = self.in_flight.get_mut(&key) {
            flight.waiters.push(waiter);
            self.metrics.record_dedup_join();
            debug!(region = %region_id, key = %key, "Joined in-flight load");
            return Vec::new();
        }

        self.in_flight.insert(key.clone(), InFlight { waiters: vec![waiter], lane: Lane::Foreground });
        self.metrics.record_request();
        debug!(region = %region_id, tier = %tier, key = %key, "Loading region");

        vec![Effect::Invoke(LoadJob { key, lane: Lane::Foreground, tier, context, loader })]
    }

    fn render_region(&mut self, region_id: &str, payload: Payload) -> Vec<Effect> {
        let Some(record) = self.regions.get_mut(region_id) else {
            return Vec::new();
        };
        record.state = RegionState::Rendered;

        vec![
            Effect::HideSkeleton { region_id: region_id.to_string() },
            Effect::Render {
                region_id: region_id.to_string(),
                generation: record.generation,
                content_type: record.registration.content_type.clone(),
                payload,
            },
        ]
    }

    // ---- load completion ---------------------------------------------------

    /// A loader invocation for `key` settled
    pub fn on_load_settled(
        &mut self,
        key: &str,
        result: Result<LoadOutput, LoadError>,
        latency: Duration,
    ) -> Vec<Effect> {
        let Some(flight) = self.in_flight.remove(key) else {
            warn!(key = %key, "Settled load was not in flight");
            return Vec::new();
        };

        self.metrics.record_settled(result.is_ok(), latency);
        if flight.lane == Lane::Prefetch {
            self.prefetch_running = false;
        }

        let mut effects = Vec::new();
        let mut touched: Vec<Tier> = Vec::new();

        match result {
            Ok(output) => {
                let ttl = output.ttl.unwrap_or(self.default_ttl);
                let payload: Payload = Arc::new(output.payload);
                self.cache.set(key, Arc::clone(&payload), ttl);

                if flight.lane == Lane::Prefetch {
                    self.prefetch_metrics.record_succeeded();
                    debug!(key = %key, "Prefetch warmed cache");
                }

                for waiter in flight.waiters {
                    self.release(&waiter, &mut touched);
                    if !self.is_live(&waiter) {
                        debug!(region = %waiter.region_id, key = %key, "Render suppressed for stale region");
                        continue;
                    }
                    self.retries.clear(&waiter.region_id);
                    effects.extend(self.render_region(&waiter.region_id, Arc::clone(&payload)));
                }
            }
            Err(err) => {
                if matches!(err, LoadError::Timeout(_)) {
                    self.metrics.record_timeout();
                }
                if flight.lane == Lane::Prefetch {
                    self.prefetch_metrics.record_failed();
                    warn!(key = %key, error = %err, "Prefetch failed");
                }

                for waiter in flight.waiters {
                    self.release(&waiter, &mut touched);
                    if self.is_live(&waiter) {
                        effects.extend(self.fail_attempt(&waiter, err.clone()));
                    }
                }
            }
        }

        for tier in touched {
            effects.extend(self.pump(tier));
        }
        effects
    }

    fn release(&mut self, waiter: &Waiter, touched: &mut Vec<Tier>) {
        self.queue_mut(waiter.tier).release_slot();
        if !touched.contains(&waiter.tier) {
            touched.push(waiter.tier);
        }
    }

    /// The waiter still refers to the current registration and is loading
    fn is_live(&self, waiter: &Waiter) -> bool {
        self.regions
            .get(&waiter.region_id)
            .is_some_and(|r| r.generation == waiter.generation && r.state == RegionState::Loading)
    }

    fn fail_attempt(&mut self, waiter: &Waiter, err: LoadError) -> Vec<Effect> {
        let region_id = waiter.region_id.as_str();

        match self.retries.record_failure(region_id, err.clone()) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    region = %region_id,
                    attempt = self.retries.attempts(region_id),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Load failed, retry scheduled"
                );
                self.metrics.record_retry();
                self.set_state(region_id, RegionState::RetryWait);
                vec![Effect::RetryAfter { region_id: region_id.to_string(), generation: waiter.generation, delay }]
            }
            RetryDecision::Exhausted { attempts, last_error } => {
                warn!(region = %region_id, attempts, error = %last_error, "Load failed, giving up");
                self.metrics.record_failed_region();
                let failure = RegionFailure::Exhausted { attempts, last_error };
                self.set_state(region_id, RegionState::Failed(failure.clone()));
                vec![
                    Effect::HideSkeleton { region_id: region_id.to_string() },
                    Effect::ShowError { region_id: region_id.to_string(), failure },
                ]
            }
        }
    }

    fn set_state(&mut self, region_id: &str, state: RegionState) {
        if let Some(record) = self.regions.get_mut(region_id) {
            record.state = state;
        }
    }

    /// Backoff of a region elapsed
    pub fn on_retry_due(&mut self, region_id: &str, generation: u64) -> Vec<Effect> {
        let Some(record) = self.regions.get(region_id) else {
            return Vec::new();
        };
        if record.generation != generation || record.state != RegionState::RetryWait {
            return Vec::new();
        }

        let tier = record.registration.tier;
        debug!(region = %region_id, attempt = self.retries.attempts(region_id) + 1, "Retrying region");
        self.enqueue(region_id, tier)
    }

    /// The renderer rejected a payload
    pub fn on_render_failed(
        &mut self,
        region_id: &str,
        generation: u64,
        payload: Payload,
        err: RenderError,
    ) -> Vec<Effect> {
        let Some(record) = self.regions.get_mut(region_id) else {
            return Vec::new();
        };
        if record.generation != generation || record.state != RegionState::Rendered {
            return Vec::new();
        }

        warn!(region = %region_id, error = %err, "Render failed");
        let failure = RegionFailure::Render { message: err.to_string(), payload };
        record.state = RegionState::Failed(failure.clone());
        self.metrics.record_render_error();

        vec![Effect::ShowError { region_id: region_id.to_string(), failure }]
    }

    // ---- manual retry ------------------------------------------------------

    /// Retry a failed region on user request
    pub fn retry(&mut self, region_id: &str) -> Result<Vec<Effect>, LoaderError> {
        let record = self
            .regions
            .get(region_id)
            .ok_or_else(|| LoaderError::UnknownRegion(region_id.to_string()))?;

        let RegionState::Failed(failure) = &record.state else {
            return Err(LoaderError::NotFailed(region_id.to_string()));
        };

        match failure.clone() {
            RegionFailure::Unsupported { content_type } => Err(LoaderError::NotRetryable {
                region: region_id.to_string(),
                reason: format!("no loader for content type '{}'", content_type),
            }),
            RegionFailure::Exhausted { .. } => {
                let tier = record.registration.tier;
                let skeleton = record.skeleton.clone();
                self.retries.clear(region_id);
                debug!(region = %region_id, "Manual retry");

                let mut effects = vec![Effect::ShowSkeleton { region_id: region_id.to_string(), skeleton }];
                effects.extend(self.enqueue(region_id, tier));
                Ok(effects)
            }
            RegionFailure::Render { payload, .. } => {
                let generation = record.generation;
                let content_type = record.registration.content_type.clone();
                self.set_state(region_id, RegionState::Rendered);
                debug!(region = %region_id, "Re-rendering retained payload");

                Ok(vec![Effect::Render { region_id: region_id.to_string(), generation, content_type, payload }])
            }
        }
    }

    // ---- prefetch ----------------------------------------------------------

    /// One tick of the prefetch lane: take one entry and load it if still useful
    pub fn prefetch_tick(&mut self) -> Vec<Effect> {
        if self.prefetch_running {
            return Vec::new();
        }
        let Some(region_id) = self.prefetch.pop() else {
            return Vec::new();
        };

        let job = match self.regions.get(&region_id) {
            Some(record)
                if record.state == RegionState::Skeleton
                    && !self.cache.contains(&record.registration.cache_key)
                    && !self.in_flight.contains_key(&record.registration.cache_key) =>
            {
                record.loader.clone().map(|loader| LoadJob {
                    key: record.registration.cache_key.clone(),
                    lane: Lane::Prefetch,
                    tier: Tier::Background,
                    context: record.context(),
                    loader,
                })
            }
            _ => None,
        };

        let Some(job) = job else {
            self.prefetch_metrics.record_skipped();
            trace!(region = %region_id, "Prefetch entry skipped");
            return Vec::new();
        };

        self.in_flight.insert(job.key.clone(), InFlight { waiters: Vec::new(), lane: Lane::Prefetch });
        self.prefetch_running = true;
        self.metrics.record_request();
        self.prefetch_metrics.record_executed();
        debug!(region = %region_id, key = %job.key, "Prefetching");

        vec![Effect::Invoke(job)]
    }

    // ---- queries and cache control -----------------------------------------

    /// The region is still registered under `generation` and showing content
    pub fn is_current(&self, region_id: &str, generation: u64) -> bool {
        self.regions
            .get(region_id)
            .is_some_and(|r| r.generation == generation && r.state == RegionState::Rendered)
    }

    pub fn region_state(&self, region_id: &str) -> Option<RegionState> {
        self.regions.get(region_id).map(|r| r.state.clone())
    }

    pub fn registration(&self, region_id: &str) -> Option<ContentRegistration> {
        self.regions.get(region_id).map(|r| r.registration.clone())
    }

    pub fn tier_load(&self, tier: Tier) -> TierLoad {
        self.queues[tier.index()].load()
    }

    pub fn tier_loads(&self) -> BTreeMap<Tier, TierLoad> {
        self.queues.iter().map(|q| (q.tier(), q.load())).collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.metrics().snapshot()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    pub fn purge_expired(&mut self) -> usize {
        self.cache.purge_expired()
    }

    /// Loads currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn prefetch_pending(&self) -> usize {
        self.prefetch.len()
    }
}
