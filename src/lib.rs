//! Single-flight async result caching
//!
//! Primitives that coalesce concurrent callers of an expensive async
//! operation onto one in-flight computation: at most one load runs per cache
//! (or per key), every concurrent caller receives the identical outcome,
//! successes are cached until invalidated, failures are never cached, and an
//! optional fallback producer answers failed calls without entering the
//! cache. Loads run as their own tasks, so canceling a waiting caller never
//! cancels the computation or other waiters.

pub mod core;
pub mod flight;

// Re-export the public surface at the crate root
pub use crate::core::error::{CacheError, Result};
pub use crate::core::stats::{FlightStats, StatsSnapshot};
pub use crate::flight::group::FlightGroup;
pub use crate::flight::keyed::KeyedCache;
pub use crate::flight::single_flight::SingleFlight;
pub use crate::flight::source::{CachedResource, Source};
