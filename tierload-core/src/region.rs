//! Region lifecycle model.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::LoadError;

/// Loaded data shared between the cache and every region rendering it
pub type Payload = Arc<serde_json::Value>;

/// Skeleton used when a content type has none registered
pub const GENERIC_SKELETON: &str = "generic";

/// Cache key used when a registration does not supply one
pub fn derive_cache_key(region_id: &str, content_type: &str) -> String {
    format!("{}:{}", content_type, region_id)
}

/// Where a region is in its lifecycle.
///
/// ```text
/// Skeleton ─► Queued ─► Loading ─► Rendered
///               ▲          │
///               │          ▼
///               └─── RetryWait ──► Failed (after the last attempt)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RegionState {
    /// Placeholder shown, waiting to become relevant
    Skeleton,
    /// Waiting for a slot in its tier
    Queued,
    /// Waiting on a loader invocation
    Loading,
    /// Last attempt failed, next one is scheduled
    RetryWait,
    /// Content displayed
    Rendered,
    /// Terminal until a manual retry
    Failed(RegionFailure),
}

impl RegionState {
    /// Rendered or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegionState::Rendered | RegionState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RegionState::Skeleton => "skeleton",
            RegionState::Queued => "queued",
            RegionState::Loading => "loading",
            RegionState::RetryWait => "retry_wait",
            RegionState::Rendered => "rendered",
            RegionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a region ended up failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionFailure {
    /// No loader for the content type; never retried
    Unsupported { content_type: String },
    /// Every attempt failed
    Exhausted {
        attempts: u32,
        #[serde(serialize_with = "display")]
        last_error: LoadError,
    },
    /// Data arrived but could not be rendered; kept for a re-render
    Render {
        message: String,
        #[serde(skip)]
        payload: Payload,
    },
}

impl RegionFailure {
    /// Text for the error panel
    pub fn user_message(&self) -> String {
        match self {
            RegionFailure::Unsupported { content_type } => {
                format!("Unsupported content: '{}' cannot be displayed", content_type)
            }
            RegionFailure::Exhausted { attempts, last_error } => {
                format!("Could not load content after {} attempts ({})", attempts, last_error)
            }
            RegionFailure::Render { message, .. } => format!("Could not display content: {}", message),
        }
    }

    /// Whether the error panel should offer a retry button
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RegionFailure::Unsupported { .. })
    }
}

fn display<T: fmt::Display, S: serde::Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
