//! Visibility triggers.
//!
//! A trigger watches registered regions and reports, once per `observe`, the
//! moment a region comes within its tier's proximity threshold of the
//! viewport. The scheduler only ever sees the resulting [`RelevanceEvent`]s.

use parking_lot::Mutex;
use std::collections::HashMap;
use tierload_core::{Tier, TierTable};
use tokio::sync::mpsc;
use tracing::trace;

/// "This region should load now"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceEvent {
    pub region_id: String,
    pub tier: Tier,
    /// Registration generation passed to `observe`
    pub generation: u64,
}

/// Channel end a trigger uses to deliver [`RelevanceEvent`]s
pub type RelevanceSender = mpsc::UnboundedSender<RelevanceEvent>;

/// Source of relevance events.
///
/// Implementations must emit at most one event per `observe` call, and none
/// after `unobserve`.
pub trait VisibilityTrigger: Send + Sync {
    /// Start watching a region. No-op if the region is already observed.
    ///
    /// `generation` identifies the registration and is echoed back in the event.
    fn observe(&self, region_id: &str, tier: Tier, generation: u64);

    /// Stop watching a region. Safe to call for unknown regions.
    fn unobserve(&self, region_id: &str);
}

/// Vertical extent of a region on the page, in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    pub top: f64,
    pub height: f64,
}

/// Visible window of the page, in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scroll_top: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { scroll_top: 0.0, height: 800.0 }
    }
}

impl Viewport {
    /// Pixels between the region and the viewport, zero when they overlap
    pub fn distance_to(&self, layout: &Layout) -> f64 {
        let bottom = self.scroll_top + self.height;
        let region_bottom = layout.top + layout.height;

        if region_bottom < self.scroll_top {
            self.scroll_top - region_bottom
        } else if layout.top > bottom {
            layout.top - bottom
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
struct Watched {
    region_id: String,
    generation: u64,
}

/// Regions attached to one tier, in observe order
#[derive(Debug, Default)]
struct TierObserver {
    threshold: f64,
    regions: Vec<Watched>,
}

#[derive(Debug, Default)]
struct ViewportState {
    viewport: Viewport,
    layouts: HashMap<String, Layout>,
    observers: [TierObserver; 5],
}

impl ViewportState {
    fn is_observed(&self, region_id: &str) -> bool {
        self.observers.iter().any(|o| o.regions.iter().any(|w| w.region_id == region_id))
    }

    fn is_relevant(&self, region_id: &str, threshold: f64) -> bool {
        self.layouts
            .get(region_id)
            .map_or(0.0, |layout| self.viewport.distance_to(layout))
            <= threshold
    }

    /// Detach and return every observed region now within range, most urgent tier first
    fn take_relevant(&mut self) -> Vec<RelevanceEvent> {
        let mut fired = Vec::new();
        for tier in Tier::ALL {
            let observer = &self.observers[tier.index()];
            let (ready, waiting): (Vec<Watched>, Vec<Watched>) = observer
                .regions
                .iter()
                .cloned()
                .partition(|w| self.is_relevant(&w.region_id, observer.threshold));

            self.observers[tier.index()].regions = waiting;
            fired.extend(ready.into_iter().map(|w| RelevanceEvent {
                region_id: w.region_id,
                tier,
                generation: w.generation,
            }));
        }
        fired
    }
}

/// Trigger driven by explicit scroll positions instead of a browser.
///
/// Holds one observer per tier, each with the tier's proximity threshold.
/// Regions without a [`Layout`] are treated as sitting in the viewport.
pub struct ViewportTrigger {
    events: RelevanceSender,
    state: Mutex<ViewportState>,
}

impl ViewportTrigger {
    pub fn new(tiers: &TierTable, events: RelevanceSender) -> Self {
        let mut state = ViewportState::default();
        for (tier, config) in tiers.iter() {
            state.observers[tier.index()].threshold = config.proximity_threshold;
        }
        Self { events, state: Mutex::new(state) }
    }

    /// Set or move a region's position on the page
    pub fn place(&self, region_id: &str, top: f64, height: f64) {
        let fired = {
            let mut state = self.state.lock();
            state.layouts.insert(region_id.to_string(), Layout { top, height });
            state.take_relevant()
        };
        self.emit(fired);
    }

    /// Scroll the viewport to an absolute offset
    pub fn scroll_to(&self, scroll_top: f64) {
        let fired = {
            let mut state = self.state.lock();
            state.viewport.scroll_top = scroll_top.max(0.0);
            state.take_relevant()
        };
        self.emit(fired);
    }

    /// Change the viewport height
    pub fn resize(&self, height: f64) {
        let fired = {
            let mut state = self.state.lock();
            state.viewport.height = height.max(0.0);
            state.take_relevant()
        };
        self.emit(fired);
    }

    pub fn viewport(&self) -> Viewport {
        self.state.lock().viewport
    }

    /// Whether a region is still waiting to become relevant
    pub fn is_observed(&self, region_id: &str) -> bool {
        self.state.lock().is_observed(region_id)
    }

    /// Number of regions still waiting at a tier
    pub fn observed_at(&self, tier: Tier) -> usize {
        self.state.lock().observers[tier.index()].regions.len()
    }

    fn emit(&self, fired: Vec<RelevanceEvent>) {
        for event in fired {
            trace!(region = %event.region_id, tier = %event.tier, "Region relevant");
            // Receiver gone means the loader was dropped
            let _ = self.events.send(event);
        }
    }
}

impl VisibilityTrigger for ViewportTrigger {
    fn observe(&self, region_id: &str, tier: Tier, generation: u64) {
        let fired = {
            let mut state = self.state.lock();
            if state.is_observed(region_id) {
                return;
            }
            state.observers[tier.index()]
                .regions
                .push(Watched { region_id: region_id.to_string(), generation });
            state.take_relevant()
        };
        self.emit(fired);
    }

    fn unobserve(&self, region_id: &str) {
        let mut state = self.state.lock();
        for observer in state.observers.iter_mut() {
            observer.regions.retain(|w| w.region_id != region_id);
        }
    }
}
