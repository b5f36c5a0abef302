use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::Result;
use crate::core::stats::StatsSnapshot;
use crate::flight::single_flight::SingleFlight;

/// Producer of a cacheable value
///
/// The seam for plugging real data layers (network clients, databases) into
/// the caches. Object-safe so callers can hold `Arc<dyn Source<T>>`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Source<T: Send + Sync + 'static>: Send + Sync {
    /// Produce the value, reporting any failure as a [`CacheError`]
    ///
    /// [`CacheError`]: crate::core::error::CacheError
    async fn load(&self) -> Result<T>;
}

/// A data-layer resource cached with single-flight semantics
///
/// Wraps a primary [`Source`] (and optionally a fallback source) in a
/// [`SingleFlight`] slot: the first `get` loads, concurrent callers coalesce,
/// a success stays cached until invalidated, a failure is answered by the
/// fallback source when one is configured (and never cached).
pub struct CachedResource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The slot holding the cached load
    inner: SingleFlight<T>,
}

impl<T> CachedResource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Cache the given source
    pub fn new(source: Arc<dyn Source<T>>) -> Self {
        Self {
            inner: SingleFlight::new(move || {
                let source = Arc::clone(&source);
                async move { source.load().await }
            }),
        }
    }

    /// Cache the given source, answering failed loads from `fallback`.
    ///
    /// The fallback's value is never cached; cancellation bypasses it.
    pub fn with_fallback(source: Arc<dyn Source<T>>, fallback: Arc<dyn Source<T>>) -> Self {
        Self {
            inner: SingleFlight::new(move || {
                let source = Arc::clone(&source);
                async move { source.load().await }
            })
            .with_fallback(move || {
                let fallback = Arc::clone(&fallback);
                async move { fallback.load().await }
            }),
        }
    }

    /// Return the resource, joining or starting a load as needed
    pub async fn get(&self) -> Result<T> {
        self.inner.get().await
    }

    /// Non-loading read of the cached resource
    pub async fn peek(&self) -> Option<T> {
        self.inner.peek().await
    }

    /// Drop the cached resource and abort an in-flight load
    pub async fn invalidate(&self) {
        self.inner.invalidate().await
    }

    /// Capture the current activity counters
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats()
    }
}
