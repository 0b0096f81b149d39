//! Content loaders and their registry.

use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tierload_core::{ConfigurationError, LoadError, Tier, GENERIC_SKELETON};

/// What a loader hands back on success
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutput {
    pub payload: serde_json::Value,
    /// Cache lifetime, `None` for the cache's default TTL
    pub ttl: Option<Duration>,
}

impl LoadOutput {
    pub fn new(payload: serde_json::Value, ttl: Duration) -> Self {
        Self { payload, ttl: Some(ttl) }
    }

    /// Output cached with the default TTL
    pub fn with_default_ttl(payload: serde_json::Value) -> Self {
        Self { payload, ttl: None }
    }

    /// Build an output from any serializable value
    pub fn from_serializable<T: Serialize>(value: &T, ttl: Duration) -> Result<Self, LoadError> {
        let payload = serde_json::to_value(value)
            .map_err(|e| LoadError::failed(format!("payload serialization failed: {}", e)))?;
        Ok(Self::new(payload, ttl))
    }
}

/// Data passed to a loader invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionContext {
    pub region_id: String,
    pub content_type: String,
    /// Caller-supplied parameters, opaque to the loader core
    pub params: serde_json::Value,
}

/// Future returned by a [`ContentLoader`]
pub type LoadFuture = BoxFuture<'static, Result<LoadOutput, LoadError>>;

/// Fetches the data for one region.
///
/// Implemented for any `Fn(RegionContext, Tier) -> impl Future`, so plain async
/// closures work as loaders.
pub trait ContentLoader: Send + Sync {
    fn load(&self, ctx: RegionContext, tier: Tier) -> LoadFuture;
}

impl<F, Fut> ContentLoader for F
where
    F: Fn(RegionContext, Tier) -> Fut + Send + Sync,
    Fut: Future<Output = Result<LoadOutput, LoadError>> + Send + 'static,
{
    fn load(&self, ctx: RegionContext, tier: Tier) -> LoadFuture {
        Box::pin(self(ctx, tier))
    }
}

/// Identifier of a skeleton template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SkeletonId(String);

impl SkeletonId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Skeleton shown for content types without one of their own
    pub fn generic() -> Self {
        Self(GENERIC_SKELETON.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SkeletonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
struct RegisteredLoader {
    loader: Arc<dyn ContentLoader>,
    skeleton: SkeletonId,
}

/// Maps content types to their loader and skeleton
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    entries: HashMap<String, RegisteredLoader>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loader and skeleton for a content type, replacing any previous one
    pub fn register<L>(&mut self, content_type: impl Into<String>, skeleton: SkeletonId, loader: L) -> &mut Self
    where
        L: ContentLoader + 'static,
    {
        self.entries.insert(content_type.into(), RegisteredLoader { loader: Arc::new(loader), skeleton });
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<L>(mut self, content_type: impl Into<String>, skeleton: SkeletonId, loader: L) -> Self
    where
        L: ContentLoader + 'static,
    {
        self.register(content_type, skeleton, loader);
        self
    }

    /// Pick the loader for a registration. An ad-hoc loader wins over the registry.
    pub fn resolve(
        &self,
        content_type: &str,
        custom: Option<&Arc<dyn ContentLoader>>,
    ) -> Result<Arc<dyn ContentLoader>, ConfigurationError> {
        if let Some(loader) = custom {
            return Ok(Arc::clone(loader));
        }
        self.entries
            .get(content_type)
            .map(|entry| Arc::clone(&entry.loader))
            .ok_or_else(|| ConfigurationError::loader_not_found(content_type))
    }

    /// Skeleton for a content type, the generic one when unknown
    pub fn skeleton_for(&self, content_type: &str) -> SkeletonId {
        self.entries
            .get(content_type)
            .map(|entry| entry.skeleton.clone())
            .unwrap_or_else(SkeletonId::generic)
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.entries.contains_key(content_type)
    }

    /// Registered content types, sorted
    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderRegistry").field("content_types", &self.content_types()).finish()
    }
}
