// tierload runtime
//
// Async side of the progressive loader: tier scheduling, loader registry,
// visibility triggers, renderer boundary, prefetch lane and metrics.

pub mod config;
pub mod loader;
pub mod metrics;
pub mod prefetch;
pub mod registry;
pub mod render;
pub mod scheduler;
pub mod visibility;

pub use config::LoaderConfig;
pub use loader::{ContentOptions, LoaderBuilder, ProgressiveLoader, TokioClock};
pub use metrics::{LoaderMetrics, MetricsSnapshot, PrometheusExporter};
pub use prefetch::{PrefetchConfig, PrefetchStats};
pub use registry::{ContentLoader, LoadFuture, LoadOutput, LoaderRegistry, RegionContext, SkeletonId};
pub use render::{RegionView, RenderDispatcher, RenderFn, Renderer, ViewChange};
pub use scheduler::{ContentRegistration, TierLoad};
pub use visibility::{Layout, RelevanceEvent, RelevanceSender, Viewport, ViewportTrigger, VisibilityTrigger};
