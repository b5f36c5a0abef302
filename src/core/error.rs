use std::fmt::{Display, Formatter};

/// Error type for cache operations
///
/// The error is `Clone` because a single failed flight is fanned out to every
/// coalesced waiter, each of which receives its own copy of the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The loader ran and reported a failure
    Load(String),
    /// The in-flight computation was canceled before it produced a result
    Canceled,
    /// The in-flight computation panicked
    Panicked(String),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Load(msg) => write!(f, "Load error: {}", msg),
            CacheError::Canceled => write!(f, "Load canceled"),
            CacheError::Panicked(msg) => write!(f, "Load panicked: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl CacheError {
    /// Build a `Load` error from any displayable source error
    pub fn load<E: Display>(source: E) -> Self {
        CacheError::Load(source.to_string())
    }

    /// Whether this error represents cancellation of the computation.
    ///
    /// Cancellation always propagates to callers unchanged; it never triggers
    /// a configured fallback and is never counted as an ordinary failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CacheError::Canceled)
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;
