//! The progressive loader facade.
//!
//! Ties the scheduler to the outside world: relevance events come in from the
//! trigger, effects go out to the renderer, the trigger and spawned loader
//! tasks. The scheduler lock is only held for one synchronous transition at a
//! time and is always released before any effect runs.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierload_core::{derive_cache_key, Clock, LoadError, LoaderError, RegionState, Tier};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::LoaderConfig;
use crate::metrics::{LoaderMetrics, MetricsSnapshot};
use crate::prefetch::{self, PrefetchMetrics};
use crate::registry::{ContentLoader, LoadOutput, LoaderRegistry};
use crate::render::{RenderDispatcher, Renderer};
use crate::scheduler::{ContentRegistration, Effect, LoadJob, Scheduler, TierLoad};
use crate::visibility::{RelevanceSender, ViewportTrigger, VisibilityTrigger};

/// Clock following tokio's time, so cache TTLs honor a paused test clock
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Per-registration options
#[derive(Clone, Default)]
pub struct ContentOptions {
    pub tier: Tier,
    pub prefetch: bool,
    /// Loader used instead of the registry's
    pub custom_loader: Option<Arc<dyn ContentLoader>>,
    /// Defaults to `<content_type>:<region_id>`
    pub cache_key: Option<String>,
    pub params: serde_json::Value,
}

impl ContentOptions {
    pub fn new(tier: Tier) -> Self {
        Self { tier, ..Self::default() }
    }

    pub fn with_prefetch(mut self) -> Self {
        self.prefetch = true;
        self
    }

    pub fn with_loader<L: ContentLoader + 'static>(mut self, loader: L) -> Self {
        self.custom_loader = Some(Arc::new(loader));
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

impl fmt::Debug for ContentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentOptions")
            .field("tier", &self.tier)
            .field("prefetch", &self.prefetch)
            .field("custom_loader", &self.custom_loader.is_some())
            .field("cache_key", &self.cache_key)
            .field("params", &self.params)
            .finish()
    }
}

/// Builds a [`ProgressiveLoader`] with injected collaborators
pub struct LoaderBuilder {
    config: LoaderConfig,
    registry: LoaderRegistry,
    renderer: Option<Arc<dyn Renderer>>,
    clock: Arc<dyn Clock>,
}

impl LoaderBuilder {
    pub fn registry(mut self, registry: LoaderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Time source for cache TTLs (default: [`TokioClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build with a [`ViewportTrigger`]. Must be called inside a tokio runtime.
    pub fn build(self) -> ProgressiveLoader<ViewportTrigger> {
        let tiers = self.config.tiers.clone();
        self.build_with_trigger(move |events| ViewportTrigger::new(&tiers, events))
    }

    /// Build with a custom trigger created from the relevance channel.
    /// Must be called inside a tokio runtime.
    pub fn build_with_trigger<T, F>(self, make_trigger: F) -> ProgressiveLoader<T>
    where
        T: VisibilityTrigger + 'static,
        F: FnOnce(RelevanceSender) -> T,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let trigger = Arc::new(make_trigger(events_tx));
        let shared_trigger: Arc<dyn VisibilityTrigger> = trigger.clone();

        let metrics = Arc::new(LoaderMetrics::new());
        let prefetch_metrics = Arc::new(PrefetchMetrics::new());
        let scheduler = Scheduler::new(&self.config, self.clock, Arc::clone(&metrics), Arc::clone(&prefetch_metrics));
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(RenderDispatcher::new().with_json_fallback()));

        let inner = Arc::new(Inner {
            scheduler: Mutex::new(scheduler),
            registry: self.registry,
            renderer,
            trigger: shared_trigger,
            metrics,
            prefetch_metrics,
            load_timeout: self.config.load_timeout,
        });

        let event_inner = Arc::clone(&inner);
        let events = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let effects = event_inner
                    .scheduler
                    .lock()
                    .on_relevant(&event.region_id, event.tier, event.generation);
                event_inner.apply(effects);
            }
        });

        let prefetch_inner = Arc::clone(&inner);
        let prefetch = tokio::spawn(prefetch::run_worker(self.config.prefetch.clone(), move || {
            let effects = prefetch_inner.scheduler.lock().prefetch_tick();
            prefetch_inner.apply(effects);
        }));

        info!(
            content_types = ?inner.registry.content_types(),
            prefetch = self.config.prefetch.enabled,
            load_timeout_ms = self.config.load_timeout.map(|t| t.as_millis() as u64),
            "Progressive loader started"
        );

        ProgressiveLoader { inner, trigger, tasks: vec![events, prefetch] }
    }
}

struct Inner {
    scheduler: Mutex<Scheduler>,
    registry: LoaderRegistry,
    renderer: Arc<dyn Renderer>,
    trigger: Arc<dyn VisibilityTrigger>,
    metrics: Arc<LoaderMetrics>,
    prefetch_metrics: Arc<PrefetchMetrics>,
    load_timeout: Option<Duration>,
}

impl Inner {
    /// Run effects in order. Must not be called with the scheduler lock held.
    fn apply(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ShowSkeleton { region_id, skeleton } => {
                    self.renderer.show_skeleton(&region_id, &skeleton);
                }
                Effect::HideSkeleton { region_id } => self.renderer.hide_skeleton(&region_id),
                Effect::Render { region_id, generation, content_type, payload } => {
                    // An earlier effect may have unregistered or replaced the region
                    if !self.scheduler.lock().is_current(&region_id, generation) {
                        debug!(region = %region_id, generation, "Render dropped for replaced region");
                        continue;
                    }
                    if let Err(err) = self.renderer.render(&region_id, &content_type, &payload) {
                        let follow_up = self.scheduler.lock().on_render_failed(&region_id, generation, payload, err);
                        self.apply(follow_up);
                    }
                }
                Effect::ShowError { region_id, failure } => self.renderer.show_error(&region_id, &failure),
                Effect::Observe { region_id, tier, generation } => {
                    self.trigger.observe(&region_id, tier, generation);
                }
                Effect::Unobserve { region_id } => self.trigger.unobserve(&region_id),
                Effect::Invoke(job) => self.spawn_load(job),
                Effect::RetryAfter { region_id, generation, delay } => {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let effects = inner.scheduler.lock().on_retry_due(&region_id, generation);
                        inner.apply(effects);
                    });
                }
                Effect::WakeTier { tier, delay } => {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let effects = inner.scheduler.lock().on_tier_wake(tier);
                        inner.apply(effects);
                    });
                }
            }
        }
    }

    fn spawn_load(self: &Arc<Self>, job: LoadJob) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let result = inner.invoke(&job).await;
            let latency = started.elapsed();

            debug!(
                key = %job.key,
                lane = ?job.lane,
                latency_ms = latency.as_millis() as u64,
                ok = result.is_ok(),
                "Load settled"
            );

            let effects = inner.scheduler.lock().on_load_settled(&job.key, result, latency);
            inner.apply(effects);
        });
    }

    /// Call the loader, turning a timeout or a panic into a transient error
    async fn invoke(&self, job: &LoadJob) -> Result<LoadOutput, LoadError> {
        let loader = Arc::clone(&job.loader);
        let context = job.context.clone();
        let tier = job.tier;
        let call = AssertUnwindSafe(async move { loader.load(context, tier).await }).catch_unwind();

        let outcome = match self.load_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(LoadError::Timeout(limit)),
            },
            None => call.await,
        };

        outcome.unwrap_or_else(|panic| Err(LoadError::panicked(panic_message(&*panic))))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Priority-tiered progressive content loader.
///
/// Regions are registered with a content type and a tier. Each one shows its
/// skeleton at once, loads when its trigger reports it relevant, and ends up
/// rendered or showing an error panel.
///
/// Background tasks (relevance events, prefetch) stop when the loader is dropped.
pub struct ProgressiveLoader<T: VisibilityTrigger + 'static = ViewportTrigger> {
    inner: Arc<Inner>,
    trigger: Arc<T>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProgressiveLoader<ViewportTrigger> {
    /// Loader with a [`ViewportTrigger`] and [`TokioClock`]. Must be called inside a tokio runtime.
    pub fn new(config: LoaderConfig, registry: LoaderRegistry, renderer: Arc<dyn Renderer>) -> Self {
        Self::builder(config).registry(registry).renderer(renderer).build()
    }

    pub fn builder(config: LoaderConfig) -> LoaderBuilder {
        LoaderBuilder {
            config,
            registry: LoaderRegistry::new(),
            renderer: None,
            clock: Arc::new(TokioClock),
        }
    }
}

impl<T: VisibilityTrigger + 'static> ProgressiveLoader<T> {
    /// Register a region: its skeleton is shown before this returns.
    ///
    /// Re-registering a region id replaces the previous registration. A
    /// content type without a loader leaves the region in a terminal failed
    /// state instead of returning an error.
    pub fn register_content(
        &self,
        region_id: impl Into<String>,
        content_type: impl Into<String>,
        options: ContentOptions,
    ) {
        let region_id = region_id.into();
        let content_type = content_type.into();

        let loader = self.inner.registry.resolve(&content_type, options.custom_loader.as_ref());
        let skeleton = self.inner.registry.skeleton_for(&content_type);
        let cache_key = options
            .cache_key
            .unwrap_or_else(|| derive_cache_key(&region_id, &content_type));

        let registration = ContentRegistration {
            region_id,
            content_type,
            tier: options.tier,
            cache_key,
            prefetch: options.prefetch,
            params: options.params,
        };

        let effects = self.inner.scheduler.lock().register(registration, loader, skeleton);
        self.inner.apply(effects);
    }

    /// Forget a region. Safe for unknown ids.
    pub fn unregister_content(&self, region_id: &str) {
        let effects = self.inner.scheduler.lock().unregister(region_id);
        self.inner.apply(effects);
    }

    /// Retry a failed region on user request
    pub fn retry(&self, region_id: &str) -> Result<(), LoaderError> {
        let effects = self.inner.scheduler.lock().retry(region_id)?;
        self.inner.apply(effects);
        Ok(())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let (cache, tiers) = {
            let scheduler = self.inner.scheduler.lock();
            (scheduler.cache_stats(), scheduler.tier_loads())
        };
        self.inner.metrics.snapshot(cache, self.inner.prefetch_metrics.snapshot(), tiers)
    }

    pub fn clear_cache(&self) {
        self.inner.scheduler.lock().clear_cache();
    }

    /// Drop one cache entry. Returns whether it was present.
    pub fn invalidate(&self, cache_key: &str) -> bool {
        self.inner.scheduler.lock().invalidate(cache_key)
    }

    /// Remove expired cache entries now instead of on the next read
    pub fn purge_expired(&self) -> usize {
        self.inner.scheduler.lock().purge_expired()
    }

    pub fn region_state(&self, region_id: &str) -> Option<RegionState> {
        self.inner.scheduler.lock().region_state(region_id)
    }

    pub fn registration(&self, region_id: &str) -> Option<ContentRegistration> {
        self.inner.scheduler.lock().registration(region_id)
    }

    pub fn tier_load(&self, tier: Tier) -> TierLoad {
        self.inner.scheduler.lock().tier_load(tier)
    }

    /// The trigger, e.g. to drive scrolling on a [`ViewportTrigger`]
    pub fn trigger(&self) -> &T {
        &self.trigger
    }

    pub fn registry(&self) -> &LoaderRegistry {
        &self.inner.registry
    }
}

impl<T: VisibilityTrigger + 'static> Drop for ProgressiveLoader<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefetch::PrefetchConfig;
    use crate::registry::{RegionContext, SkeletonId};
    use crate::render::RegionView;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tierload_core::{Payload, RegionFailure, RenderError, RetryPolicy, TierConfig};

    /// Loader that counts calls, records start times and resolves after `delay`
    #[derive(Clone, Default)]
    struct FakeSource {
        calls: Arc<AtomicUsize>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        starts: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    impl FakeSource {
        fn loader(&self, delay: Duration, payload: Value) -> impl ContentLoader {
            let source = self.clone();
            move |_ctx: RegionContext, _tier: Tier| {
                let source = source.clone();
                let payload = payload.clone();
                async move {
                    source.calls.fetch_add(1, Ordering::SeqCst);
                    source.starts.lock().push(tokio::time::Instant::now());
                    let running = source.running.fetch_add(1, Ordering::SeqCst) + 1;
                    source.peak.fetch_max(running, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    source.running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, LoadError>(LoadOutput::new(payload, Duration::from_secs(300)))
                }
            }
        }

        fn failing(&self, message: &'static str) -> impl ContentLoader {
            let source = self.clone();
            move |_ctx: RegionContext, _tier: Tier| {
                let source = source.clone();
                async move {
                    source.calls.fetch_add(1, Ordering::SeqCst);
                    source.starts.lock().push(tokio::time::Instant::now());
                    Err::<LoadOutput, _>(LoadError::failed(message))
                }
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn setup(config: LoaderConfig, registry: LoaderRegistry) -> (ProgressiveLoader, Arc<RenderDispatcher>) {
        let renderer = Arc::new(
            RenderDispatcher::new()
                .with_renderer("meals", |payload| Ok(format!("<meals>{}</meals>", payload)))
                .with_json_fallback(),
        );
        let loader = ProgressiveLoader::new(config, registry, renderer.clone());
        (loader, renderer)
    }

    fn quiet() -> LoaderConfig {
        LoaderConfig::default().with_prefetch(PrefetchConfig::disabled())
    }

    async fn tick() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_region_renders_after_load() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(50), json!({ "meals": ["soup"] })),
        );
        let (loader, renderer) = setup(quiet(), registry);

        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        // Skeleton is up before anything else runs
        assert_eq!(renderer.view("r1"), Some(RegionView::Skeleton { skeleton: SkeletonId::new("meal-list") }));

        tick().await;
        assert_eq!(loader.region_state("r1"), Some(RegionState::Loading));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(loader.region_state("r1"), Some(RegionState::Rendered));
        assert!(matches!(renderer.view("r1"), Some(RegionView::Content { .. })));

        let metrics = loader.get_metrics();
        assert_eq!(source.calls(), 1);
        assert_eq!(metrics.cache_hits, 0);
        assert_eq!(metrics.successful_loads, 1);
        assert_eq!(metrics.total_requests, 1);
        assert!(metrics.avg_latency_ms >= 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_key_served_from_cache() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(50), json!({ "meals": ["soup"] })),
        );
        let (loader, renderer) = setup(quiet(), registry);

        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        tokio::time::sleep(Duration::from_millis(60)).await;

        loader.register_content("r2", "meals", ContentOptions::new(Tier::Critical).with_cache_key("meals:r1"));
        tick().await;

        assert_eq!(source.calls(), 1);
        assert_eq!(loader.get_metrics().cache_hits, 1);
        assert_eq!(loader.region_state("r2"), Some(RegionState::Rendered));
        assert_eq!(renderer.view("r2"), renderer.view("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_loader_gives_up_after_three() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with("meals", SkeletonId::new("meal-list"), source.failing("offline"));
        let (loader, renderer) = setup(quiet(), registry);

        loader.register_content("r3", "meals", ContentOptions::new(Tier::Critical));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(source.calls(), 3);
        let starts = source.starts.lock().clone();
        let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(500));
        assert!(gaps[1] > gaps[0]);

        match loader.region_state("r3") {
            Some(RegionState::Failed(RegionFailure::Exhausted { attempts, .. })) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted region, got {:?}", other),
        }
        assert!(matches!(renderer.view("r3"), Some(RegionView::Error { retryable: true, .. })));

        let metrics = loader.get_metrics();
        assert_eq!(metrics.failed_loads, 1);
        assert_eq!(metrics.retries_scheduled, 2);

        // Never a fourth automatic attempt
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_tier_admits_five_then_waits() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(50), json!({})),
        );
        let (loader, _renderer) = setup(quiet(), registry);
        let t0 = tokio::time::Instant::now();

        for i in 0..8 {
            loader.register_content(format!("n{}", i), "meals", ContentOptions::new(Tier::Normal));
        }
        tick().await;
        assert_eq!(loader.tier_load(Tier::Normal), TierLoad { queued: 3, loading: 5 });
        assert_eq!(source.calls(), 5);

        // All five settled at 50ms, the next batch waits for the 100ms spacing
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(loader.tier_load(Tier::Normal), TierLoad { queued: 3, loading: 0 });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.calls(), 8);
        assert!(source.peak.load(Ordering::SeqCst) <= 5);

        let starts = source.starts.lock().clone();
        assert!(starts[..5].iter().all(|s| *s - t0 < Duration::from_millis(5)));
        assert!(starts[5..].iter().all(|s| *s - t0 >= Duration::from_millis(100)));
        for i in 0..8 {
            assert_eq!(loader.region_state(&format!("n{}", i)), Some(RegionState::Rendered));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_regions_share_one_load() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(50), json!({ "shared": true })),
        );
        let (loader, renderer) = setup(quiet(), registry);

        loader.register_content("a", "meals", ContentOptions::new(Tier::High).with_cache_key("week-plan"));
        loader.register_content("b", "meals", ContentOptions::new(Tier::High).with_cache_key("week-plan"));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(source.calls(), 1);
        assert_eq!(renderer.rendered_count(), 2);
        assert_eq!(loader.get_metrics().dedup_joins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skeleton_precedes_content_for_every_region() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::ZERO, json!(1)),
        );
        let (loader, renderer) = setup(quiet(), registry);

        for i in 0..12 {
            let tier = Tier::ALL[i % Tier::ALL.len()];
            loader.register_content(format!("r{}", i), "meals", ContentOptions::new(tier).with_cache_key("same"));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        for i in 0..12 {
            let history = renderer.history_for(&format!("r{}", i));
            assert!(matches!(history.first(), Some(RegionView::Skeleton { .. })));
            assert!(matches!(history.last(), Some(RegionView::Content { .. })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_content_type_fails_without_retry() {
        let (loader, renderer) = setup(quiet(), LoaderRegistry::new());

        loader.register_content("v1", "video", ContentOptions::new(Tier::Critical));
        tick().await;

        assert_eq!(
            renderer.history_for("v1").first(),
            Some(&RegionView::Skeleton { skeleton: SkeletonId::generic() })
        );
        assert!(matches!(renderer.view("v1"), Some(RegionView::Error { retryable: false, .. })));
        assert!(matches!(loader.retry("v1"), Err(LoaderError::NotRetryable { .. })));

        let metrics = loader.get_metrics();
        assert_eq!(metrics.failed_loads, 1);
        assert_eq!(metrics.unsupported, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_loader_overrides_registry() {
        let registered = FakeSource::default();
        let custom = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            registered.loader(Duration::ZERO, json!("registry")),
        );
        let (loader, _renderer) = setup(quiet(), registry);

        loader.register_content(
            "r1",
            "meals",
            ContentOptions::new(Tier::Critical).with_loader(custom.loader(Duration::ZERO, json!("custom"))),
        );
        tick().await;

        assert_eq!(registered.calls(), 0);
        assert_eq!(custom.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_reloads() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with("meals", SkeletonId::new("meal-list"), source.failing("down"));
        let (loader, renderer) = setup(quiet(), registry);

        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls(), 3);

        loader.retry("r1").unwrap();
        assert!(matches!(renderer.view("r1"), Some(RegionView::Skeleton { .. })));
        tick().await;
        assert_eq!(source.calls(), 4);

        // Attempts were reset, so the full budget is available again
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls(), 6);
        assert_eq!(loader.get_metrics().failed_loads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failure_retry_reuses_payload() {
        let source = FakeSource::default();
        let broken = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&broken);
        let renderer = Arc::new(RenderDispatcher::new().with_renderer("meals", move |payload| {
            if flag.load(Ordering::SeqCst) {
                Err(RenderError::failed("template missing"))
            } else {
                Ok(payload.to_string())
            }
        }));
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(10), json!({ "ok": 1 })),
        );
        let loader = ProgressiveLoader::new(quiet(), registry, renderer.clone());

        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            loader.region_state("r1"),
            Some(RegionState::Failed(RegionFailure::Render { .. }))
        ));
        assert_eq!(loader.get_metrics().render_errors, 1);

        broken.store(false, Ordering::SeqCst);
        loader.retry("r1").unwrap();

        assert_eq!(loader.region_state("r1"), Some(RegionState::Rendered));
        assert_eq!(renderer.view("r1"), Some(RegionView::Content { markup: "{\"ok\":1}".into() }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient_failure() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_secs(3600), json!(null)),
        );
        let config = quiet().with_load_timeout(Duration::from_millis(100));
        let (loader, _renderer) = setup(config, registry);

        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        tokio::time::sleep(Duration::from_secs(5)).await;

        match loader.region_state("r1") {
            Some(RegionState::Failed(RegionFailure::Exhausted { last_error, .. })) => {
                assert_eq!(last_error, LoadError::Timeout(Duration::from_millis(100)));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
        assert_eq!(loader.get_metrics().timeouts, 3);
        assert_eq!(loader.tier_load(Tier::Critical), TierLoad::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_loader_releases_slot() {
        let tiers = LoaderConfig::default().tiers.with(Tier::Low, TierConfig::new(1, Duration::ZERO, 0.0));
        let retry = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
        let config = quiet().with_tiers(tiers).with_retry(retry);

        let source = FakeSource::default();
        let registry = LoaderRegistry::new()
            .with("boom", SkeletonId::generic(), |ctx: RegionContext, _tier: Tier| async move {
                if ctx.region_id == "bad" {
                    panic!("loader exploded");
                }
                Ok::<_, LoadError>(LoadOutput::with_default_ttl(json!(null)))
            })
            .with("meals", SkeletonId::new("meal-list"), source.loader(Duration::ZERO, json!(1)));
        let (loader, _renderer) = setup(config, registry);

        loader.register_content("bad", "boom", ContentOptions::new(Tier::Low));
        loader.register_content("good", "meals", ContentOptions::new(Tier::Low));
        tokio::time::sleep(Duration::from_millis(50)).await;

        match loader.region_state("bad") {
            Some(RegionState::Failed(RegionFailure::Exhausted { last_error, .. })) => {
                assert_eq!(last_error, LoadError::panicked("loader exploded"));
            }
            other => panic!("expected panic failure, got {:?}", other),
        }
        assert_eq!(loader.region_state("good"), Some(RegionState::Rendered));
    }

    /// Host surface that removes a region's element once its skeleton is hidden
    struct RemovingHost {
        surface: RenderDispatcher,
        loader: Mutex<Option<Arc<ProgressiveLoader>>>,
    }

    impl Renderer for RemovingHost {
        fn show_skeleton(&self, region_id: &str, skeleton: &SkeletonId) {
            self.surface.show_skeleton(region_id, skeleton);
        }

        fn hide_skeleton(&self, region_id: &str) {
            self.surface.hide_skeleton(region_id);
            let loader = self.loader.lock().clone();
            if let Some(loader) = loader {
                loader.unregister_content(region_id);
            }
        }

        fn render(&self, region_id: &str, content_type: &str, payload: &Payload) -> Result<(), RenderError> {
            self.surface.render(region_id, content_type, payload)
        }

        fn show_error(&self, region_id: &str, failure: &RegionFailure) {
            self.surface.show_error(region_id, failure);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_region_removed_by_host_mid_render_gets_no_content() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(10), json!(1)),
        );
        let host = Arc::new(RemovingHost {
            surface: RenderDispatcher::new().with_json_fallback(),
            loader: Mutex::new(None),
        });
        let loader = Arc::new(ProgressiveLoader::new(quiet(), registry, host.clone()));
        *host.loader.lock() = Some(Arc::clone(&loader));

        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(source.calls(), 1);
        assert!(loader.region_state("r1").is_none());
        assert_eq!(host.surface.rendered_count(), 0);
        assert!(!host.surface.history_for("r1").iter().any(|v| matches!(v, RegionView::Content { .. })));

        host.loader.lock().take();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistered_region_ignores_earlier_relevance() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::ZERO, json!(1)),
        );
        let (loader, _renderer) = setup(quiet(), registry);

        // Unplaced: relevant at once, event still queued
        loader.register_content("r1", "meals", ContentOptions::new(Tier::Normal));
        loader.trigger().place("r1", 10_000.0, 300.0);
        loader.register_content("r1", "meals", ContentOptions::new(Tier::Normal));
        tick().await;

        assert_eq!(source.calls(), 0);
        assert_eq!(loader.region_state("r1"), Some(RegionState::Skeleton));
        assert!(loader.trigger().is_observed("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_while_loading_suppresses_render() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(50), json!(7)),
        );
        let (loader, renderer) = setup(quiet(), registry);

        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        tick().await;
        loader.unregister_content("r1");
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(loader.region_state("r1").is_none());
        assert!(!renderer.history_for("r1").iter().any(|v| matches!(v, RegionView::Content { .. })));

        // The result was still cached
        loader.register_content("r1", "meals", ContentOptions::new(Tier::Critical));
        tick().await;
        assert_eq!(source.calls(), 1);
        assert_eq!(loader.region_state("r1"), Some(RegionState::Rendered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_drives_low_tier_region() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::ZERO, json!(1)),
        );
        let (loader, _renderer) = setup(quiet(), registry);

        loader.trigger().place("footer", 5000.0, 300.0);
        loader.register_content("footer", "meals", ContentOptions::new(Tier::Low));
        tick().await;
        assert_eq!(loader.region_state("footer"), Some(RegionState::Skeleton));

        // 1000px threshold: viewport bottom at 4100 is 900px away
        loader.trigger().scroll_to(3300.0);
        tick().await;
        assert_eq!(loader.region_state("footer"), Some(RegionState::Rendered));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_warms_cache_before_scroll() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::from_millis(10), json!("warm")),
        );
        let (loader, _renderer) = setup(LoaderConfig::default(), registry);

        loader.trigger().place("later", 20_000.0, 300.0);
        loader.register_content("later", "meals", ContentOptions::new(Tier::Normal).with_prefetch());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(source.calls(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(source.calls(), 1);
        // Prefetch never renders
        assert_eq!(loader.region_state("later"), Some(RegionState::Skeleton));

        loader.trigger().scroll_to(20_000.0);
        tick().await;
        assert_eq!(loader.region_state("later"), Some(RegionState::Rendered));
        assert_eq!(source.calls(), 1);

        let metrics = loader.get_metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.prefetch.executed, 1);
        assert_eq!(metrics.prefetch.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reloads() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            |_ctx: RegionContext, _tier: Tier| async {
                Ok::<_, LoadError>(LoadOutput::new(json!(1), Duration::from_millis(100)))
            },
        );
        let registry = registry.with("counted", SkeletonId::generic(), source.loader(Duration::ZERO, json!(2)));
        let (loader, _renderer) = setup(quiet(), registry);

        loader.register_content("a", "meals", ContentOptions::new(Tier::Critical).with_cache_key("k"));
        tick().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        loader.register_content("b", "counted", ContentOptions::new(Tier::Critical).with_cache_key("k"));
        tick().await;

        assert_eq!(source.calls(), 1);
        assert_eq!(loader.get_metrics().cache_misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear_cache() {
        let source = FakeSource::default();
        let registry = LoaderRegistry::new().with(
            "meals",
            SkeletonId::new("meal-list"),
            source.loader(Duration::ZERO, json!(1)),
        );
        let (loader, _renderer) = setup(quiet(), registry);

        loader.register_content("a", "meals", ContentOptions::new(Tier::Critical));
        tick().await;
        assert!(loader.invalidate("meals:a"));
        assert!(!loader.invalidate("meals:a"));

        loader.register_content("a", "meals", ContentOptions::new(Tier::Critical));
        tick().await;
        assert_eq!(source.calls(), 2);

        assert_eq!(loader.get_metrics().cache.invalidations, 1);
        loader.clear_cache();
        assert_eq!(loader.purge_expired(), 0);

        loader.register_content("a", "meals", ContentOptions::new(Tier::Critical));
        tick().await;
        assert_eq!(source.calls(), 3);
    }
}
