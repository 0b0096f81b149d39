//! Renderer boundary.
//!
//! The scheduler never touches markup. It tells a [`Renderer`] to show a
//! skeleton, swap it for content, or show an error panel, and the renderer
//! decides what that means for the host surface.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tierload_core::{Payload, RegionFailure, RenderError};

use crate::registry::SkeletonId;

/// Host surface for region content
pub trait Renderer: Send + Sync {
    fn show_skeleton(&self, region_id: &str, skeleton: &SkeletonId);

    fn hide_skeleton(&self, region_id: &str);

    /// Replace the region's view with content built from `payload`
    fn render(&self, region_id: &str, content_type: &str, payload: &Payload) -> Result<(), RenderError>;

    fn show_error(&self, region_id: &str, failure: &RegionFailure);
}

/// Turns a payload into markup
pub type RenderFn = Arc<dyn Fn(&serde_json::Value) -> Result<String, RenderError> + Send + Sync>;

/// What a region currently displays
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum RegionView {
    /// Nothing, between skeleton and content
    Empty,
    Skeleton { skeleton: SkeletonId },
    Content { markup: String },
    Error { message: String, retryable: bool },
}

/// One recorded view change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewChange {
    pub region_id: String,
    #[serde(flatten)]
    pub view: RegionView,
}

#[derive(Debug, Default)]
struct Surface {
    views: HashMap<String, RegionView>,
    history: Vec<ViewChange>,
}

impl Surface {
    fn set(&mut self, region_id: &str, view: RegionView) {
        self.views.insert(region_id.to_string(), view.clone());
        self.history.push(ViewChange { region_id: region_id.to_string(), view });
    }
}

/// In-memory [`Renderer`] with per-content-type render functions.
///
/// Keeps the current view of every region plus the full transition history,
/// which makes it usable both as a headless host and as a test double.
#[derive(Default)]
pub struct RenderDispatcher {
    renderers: HashMap<String, RenderFn>,
    fallback: Option<RenderFn>,
    surface: Mutex<Surface>,
}

impl RenderDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the render function for a content type
    pub fn with_renderer<F>(mut self, content_type: impl Into<String>, render: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<String, RenderError> + Send + Sync + 'static,
    {
        self.renderers.insert(content_type.into(), Arc::new(render));
        self
    }

    /// Render function used for content types without their own
    pub fn with_fallback<F>(mut self, render: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<String, RenderError> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(render));
        self
    }

    /// Fallback that prints the payload as compact JSON
    pub fn with_json_fallback(self) -> Self {
        self.with_fallback(|payload| Ok(payload.to_string()))
    }

    /// Current view of a region
    pub fn view(&self, region_id: &str) -> Option<RegionView> {
        self.surface.lock().views.get(region_id).cloned()
    }

    /// Every view change so far, in order
    pub fn history(&self) -> Vec<ViewChange> {
        self.surface.lock().history.clone()
    }

    /// View changes of one region, in order
    pub fn history_for(&self, region_id: &str) -> Vec<RegionView> {
        self.surface
            .lock()
            .history
            .iter()
            .filter(|change| change.region_id == region_id)
            .map(|change| change.view.clone())
            .collect()
    }

    /// Number of regions currently showing content
    pub fn rendered_count(&self) -> usize {
        self.surface
            .lock()
            .views
            .values()
            .filter(|view| matches!(view, RegionView::Content { .. }))
            .count()
    }
}

impl Renderer for RenderDispatcher {
    fn show_skeleton(&self, region_id: &str, skeleton: &SkeletonId) {
        self.surface.lock().set(region_id, RegionView::Skeleton { skeleton: skeleton.clone() });
    }

    fn hide_skeleton(&self, region_id: &str) {
        let mut surface = self.surface.lock();
        if matches!(surface.views.get(region_id), Some(RegionView::Skeleton { .. })) {
            surface.set(region_id, RegionView::Empty);
        }
    }

    fn render(&self, region_id: &str, content_type: &str, payload: &Payload) -> Result<(), RenderError> {
        let render = self
            .renderers
            .get(content_type)
            .or(self.fallback.as_ref())
            .ok_or_else(|| RenderError::NoRenderer(content_type.to_string()))?;

        // Markup is built outside the surface lock
        let markup = render(payload)?;
        self.surface.lock().set(region_id, RegionView::Content { markup });
        Ok(())
    }

    fn show_error(&self, region_id: &str, failure: &RegionFailure) {
        let view = RegionView::Error { message: failure.user_message(), retryable: failure.is_retryable() };
        self.surface.lock().set(region_id, view);
    }
}
