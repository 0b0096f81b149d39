//! Error types for the tierload core library
//!
//! # Error Hierarchy
//!
//! ```text
//! LoadError            - transient, retried with backoff
//! ConfigurationError   - fatal, never retried (missing loader, bad config)
//! RenderError          - terminal for the region, data is kept
//! LoaderError          - misuse of the registration API
//! ```
//!
//! None of these escape `register_content`: the scheduler turns them into
//! failed-region metadata. Application code should wrap them with `anyhow`.

use std::time::Duration;
use thiserror::Error;

/// Transient failure of a loader invocation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The loader reported a failure
    #[error("load failed: {0}")]
    Failed(String),

    /// The loader did not settle within the configured timeout
    #[error("load timed out after {0:?}")]
    Timeout(Duration),

    /// The loader future panicked
    #[error("loader panicked: {0}")]
    Panicked(String),
}

impl LoadError {
    /// Create a generic load failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Create a panic error from a caught panic payload
    pub fn panicked(msg: impl Into<String>) -> Self {
        Self::Panicked(msg.into())
    }
}

/// Fatal configuration problems
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// No loader registered for the content type and none supplied
    #[error("no loader registered for content type '{content_type}'")]
    LoaderNotFound { content_type: String },

    /// Tier name not recognized
    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    /// Eviction policy name not recognized
    #[error("unknown eviction policy '{0}'")]
    UnknownEvictionPolicy(String),
}

impl ConfigurationError {
    /// Create a loader-not-found error
    pub fn loader_not_found(content_type: impl Into<String>) -> Self {
        Self::LoaderNotFound { content_type: content_type.into() }
    }
}

/// Failure raised by the renderer while applying fetched data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Failed(String),

    /// No render function for the content type
    #[error("no renderer for content type '{0}'")]
    NoRenderer(String),
}

impl RenderError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Errors returned by the loader's public API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoaderError {
    /// Region id is not registered
    #[error("region '{0}' is not registered")]
    UnknownRegion(String),

    /// Region is not in the failed state
    #[error("region '{0}' has not failed")]
    NotFailed(String),

    /// Region failed in a way a retry cannot fix
    #[error("region '{region}' cannot be retried: {reason}")]
    NotRetryable { region: String, reason: String },
}
