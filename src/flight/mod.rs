//! Single-flight caching primitives
//!
//! Every cache in this module follows the same flight discipline: a load is
//! spawned as its own task and shared among waiters, so at most one
//! computation runs per cache (or per key) and canceling a waiter can never
//! cancel the computation or disturb other waiters.

pub mod group;
pub mod keyed;
pub mod single_flight;
pub mod source;

// Re-export the cache types for convenience
pub use group::FlightGroup;
pub use keyed::KeyedCache;
pub use single_flight::SingleFlight;
pub use source::{CachedResource, Source};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;

use crate::core::error::{CacheError, Result};

/// A shared handle to one in-flight load, clonable per waiter
pub(crate) type SharedFlight<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Wrap a spawned load so every waiter can await the same outcome.
///
/// The join handle keeps the task result alive even if every current waiter
/// drops, so a later caller can still collect the settled outcome. Task
/// aborts surface as `Canceled`, panics as `Panicked`.
pub(crate) fn share_flight<T>(handle: JoinHandle<Result<T>>) -> SharedFlight<T>
where
    T: Clone + Send + 'static,
{
    async move {
        match handle.await {
            Ok(outcome) => outcome,
            Err(join) if join.is_cancelled() => Err(CacheError::Canceled),
            Err(join) => Err(CacheError::Panicked(join.to_string())),
        }
    }
    .boxed()
    .shared()
}
