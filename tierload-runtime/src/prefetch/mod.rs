//! Background prefetch lane.
//!
//! Regions registered with `prefetch: true` are loaded ahead of need, one at a
//! time, so that the cache is warm when they scroll into range.
//!
//! # Architecture
//!
//! ```text
//! register_content(prefetch: true)
//!            │
//!            ▼
//!      PrefetchQueue (FIFO, bounded)
//!            │
//!            ▼ every `interval`, one entry
//!      prefetch tick ──► skip if gone / relevant / cached / in flight
//!            │
//!            ▼
//!      loader at background tier ──► CacheStore (never renders)
//! ```
//!
//! Prefetch loads share the in-flight map with regular loads but hold no tier
//! slot. Failures are counted and dropped, never retried.

mod config;
mod metrics;
mod queue;

pub use config::PrefetchConfig;
pub use metrics::{PrefetchMetrics, PrefetchStats};
pub use queue::PrefetchQueue;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// Drive the prefetch lane: call `on_tick` once per configured interval.
///
/// The first tick fires one full interval after start. Returns immediately
/// when prefetch is disabled.
pub async fn run_worker<F>(config: PrefetchConfig, mut on_tick: F)
where
    F: FnMut() + Send,
{
    if !config.enabled {
        info!("Prefetch disabled, worker not starting");
        return;
    }

    info!(interval_ms = config.interval.as_millis() as u64, "Prefetch worker started");

    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        on_tick();
    }
}
