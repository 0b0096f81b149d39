//! Side effects produced by scheduler transitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tierload_core::{Payload, RegionFailure, Tier};

use crate::registry::{ContentLoader, RegionContext, SkeletonId};

/// Which lane started a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// Started by a relevant region, holds tier slots
    Foreground,
    /// Started by the prefetch worker, holds no slot
    Prefetch,
}

/// A loader invocation to spawn
pub(crate) struct LoadJob {
    pub key: String,
    pub lane: Lane,
    pub tier: Tier,
    pub context: RegionContext,
    pub loader: Arc<dyn ContentLoader>,
}

impl fmt::Debug for LoadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadJob")
            .field("key", &self.key)
            .field("lane", &self.lane)
            .field("tier", &self.tier)
            .field("region_id", &self.context.region_id)
            .finish()
    }
}

/// Work the loader performs once the scheduler lock is released
#[derive(Debug)]
pub(crate) enum Effect {
    ShowSkeleton { region_id: String, skeleton: SkeletonId },
    HideSkeleton { region_id: String },
    Render { region_id: String, generation: u64, content_type: String, payload: Payload },
    ShowError { region_id: String, failure: RegionFailure },
    Observe { region_id: String, tier: Tier, generation: u64 },
    Unobserve { region_id: String },
    Invoke(LoadJob),
    /// Re-queue a region after its backoff
    RetryAfter { region_id: String, generation: u64, delay: Duration },
    /// Let a tier admit its next batch after the delay
    WakeTier { tier: Tier, delay: Duration },
}
