//! Core types shared by every cache in the crate
//!
//! This module contains the crate error type and the activity counters that
//! each cache exposes for inspection.

pub mod error;
pub mod stats;

// Re-export core types for convenience
pub use error::{CacheError, Result};
pub use stats::{FlightStats, StatsSnapshot};
