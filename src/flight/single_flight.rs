use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::core::error::Result;
use crate::core::stats::{FlightStats, StatsSnapshot};
use crate::flight::{share_flight, SharedFlight};

/// Producer invoked to (re)compute the cached value
type Loader<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Single-slot cache that runs its loader at most once at a time
///
/// The first caller starts the load; callers arriving while it is in flight
/// await the same shared outcome. A successful value is cached until
/// [`invalidate`](SingleFlight::invalidate) is called. A failed load is never
/// cached: the slot is cleared and the next caller retries. An optional
/// fallback producer answers failed calls without its result ever entering
/// the cache.
///
/// The load runs as its own task, so dropping a waiting caller cancels only
/// that caller. The computation and every other waiter are unaffected.
pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Slot state machine, guarded so transitions are serialized
    slot: Mutex<Slot<T>>,
    /// Producer for the cached value
    loader: Loader<T>,
    /// Optional producer consulted on load failure; its result is not cached
    fallback: Option<Loader<T>>,
    /// Monotonic flight counter; stale flights cannot settle the slot
    generation: AtomicU64,
    /// Activity counters
    stats: FlightStats,
}

/// State of the cache slot
enum Slot<T> {
    /// Nothing cached, nothing running
    Empty,
    /// A load is running; waiters share its outcome
    InFlight {
        generation: u64,
        flight: SharedFlight<T>,
        abort: AbortHandle,
    },
    /// A successful value is cached
    Ready(T),
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache around the given loader
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            slot: Mutex::new(Slot::Empty),
            loader: Box::new(move || loader().boxed()),
            fallback: None,
            generation: AtomicU64::new(0),
            stats: FlightStats::new(),
        }
    }

    /// Configure a fallback producer consulted when a load fails.
    ///
    /// The fallback result is returned to the caller but never cached, and it
    /// is skipped entirely when the load was canceled.
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fallback = Some(Box::new(move || fallback().boxed()));
        self
    }

    /// Return the cached value, joining or starting a load as needed
    pub async fn get(&self) -> Result<T> {
        let (generation, flight) = {
            let mut slot = self.slot.lock().await;
            match &*slot {
                Slot::Ready(value) => {
                    self.stats.record_hit();
                    return Ok(value.clone());
                }
                Slot::InFlight {
                    generation, flight, ..
                } => {
                    self.stats.record_coalesced();
                    debug!("joining in-flight load (generation {})", generation);
                    (*generation, flight.clone())
                }
                Slot::Empty => {
                    self.stats.record_miss();
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let handle = tokio::spawn((self.loader)());
                    let abort = handle.abort_handle();
                    let flight = share_flight(handle);
                    debug!("starting load (generation {})", generation);
                    *slot = Slot::InFlight {
                        generation,
                        flight: flight.clone(),
                        abort,
                    };
                    (generation, flight)
                }
            }
        };

        // Await outside the lock so waiters never serialize on the mutex.
        let outcome = flight.await;
        self.settle(generation, &outcome).await;
        self.resolve(outcome).await
    }

    /// Non-loading read of the cached value
    pub async fn peek(&self) -> Option<T> {
        match &*self.slot.lock().await {
            Slot::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Drop any cached value and abort an in-flight load.
    ///
    /// Waiters on an aborted load observe [`CacheError::Canceled`]
    /// (fallbacks are not consulted for cancellation).
    ///
    /// [`CacheError::Canceled`]: crate::core::error::CacheError::Canceled
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::InFlight {
                generation, abort, ..
            } => {
                debug!("aborting in-flight load (generation {})", generation);
                abort.abort();
            }
            Slot::Ready(_) => {
                debug!("dropping cached value");
            }
            Slot::Empty => {}
        }
        *slot = Slot::Empty;
    }

    /// Capture the current activity counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Write a flight outcome back into the slot.
    ///
    /// Only the flight that currently occupies the slot may settle it;
    /// superseded generations and already-settled flights are no-ops. Success
    /// becomes `Ready`, failure clears the slot so the next call retries.
    async fn settle(&self, generation: u64, outcome: &Result<T>) {
        let mut slot = self.slot.lock().await;
        let current = match &*slot {
            Slot::InFlight { generation, .. } => *generation,
            _ => return,
        };
        if current != generation {
            return;
        }
        match outcome {
            Ok(value) => {
                debug!("load settled, caching value (generation {})", generation);
                *slot = Slot::Ready(value.clone());
            }
            Err(err) => {
                debug!(
                    "load failed, clearing slot (generation {}): {}",
                    generation, err
                );
                *slot = Slot::Empty;
            }
        }
    }

    /// Map a flight outcome to the caller's result, applying the fallback
    async fn resolve(&self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                self.stats.record_failure();
                match &self.fallback {
                    Some(fallback) => {
                        warn!("load failed, serving fallback: {}", err);
                        self.stats.record_fallback();
                        fallback().await
                    }
                    None => Err(err),
                }
            }
        }
    }
}

// Tests for SingleFlight
#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CacheError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    /// Route the cache's debug lines through env_logger when RUST_LOG is set
    fn init_test_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Loader that counts invocations and blocks until the gate releases it
    fn gated_loader(
        calls: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
        value: i32,
    ) -> impl Fn() -> BoxFuture<'static, Result<i32>> + Send + Sync + 'static {
        move || {
            let calls = calls.clone();
            let gate = gate.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|e| CacheError::Load(e.to_string()))?;
                permit.forget();
                Ok(value)
            }
            .boxed()
        }
    }

    // Test that a cached success is served without re-invoking the loader
    #[tokio::test]
    async fn test_cached_value_served_without_reload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlight::new({
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            }
        });

        assert_eq!(cache.get().await, Ok(42));
        assert_eq!(cache.get().await, Ok(42));
        assert_eq!(cache.get().await, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    // Test that concurrent callers share one load and one value
    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        init_test_logs();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let cache = Arc::new(SingleFlight::new(gated_loader(
            calls.clone(),
            gate.clone(),
            7,
        )));

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            waiters.push(tokio::spawn(async move { cache.get().await }));
        }

        // Let every waiter reach the flight before releasing the loader
        while cache.stats().coalesced < 3 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses, 1);
    }

    // Test that a failed load is not cached and the next call retries
    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlight::new({
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CacheError::Load("flaky".to_string()))
                    } else {
                        Ok(5)
                    }
                }
            }
        });

        assert_eq!(
            cache.get().await,
            Err(CacheError::Load("flaky".to_string()))
        );
        assert_eq!(cache.peek().await, None);
        assert_eq!(cache.get().await, Ok(5));
        assert_eq!(cache.get().await, Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().failures, 1);
    }

    // Test that the fallback answers a failed call but is never cached
    #[tokio::test]
    async fn test_fallback_is_served_but_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlight::new({
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CacheError::Load("cold start".to_string()))
                    } else {
                        Ok(10)
                    }
                }
            }
        })
        .with_fallback(|| async { Ok(-1) });

        // First call fails and is answered by the fallback
        assert_eq!(cache.get().await, Ok(-1));
        assert_eq!(cache.peek().await, None);
        assert_eq!(cache.stats().fallbacks, 1);

        // The fallback value was not cached; the loader runs again
        assert_eq!(cache.get().await, Ok(10));
        assert_eq!(cache.peek().await, Some(10));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // Test that a fallback failure propagates to the caller
    #[tokio::test]
    async fn test_fallback_error_propagates() {
        let cache: SingleFlight<i32> =
            SingleFlight::new(|| async { Err(CacheError::Load("primary down".to_string())) })
                .with_fallback(|| async { Err(CacheError::Load("fallback down".to_string())) });

        assert_eq!(
            cache.get().await,
            Err(CacheError::Load("fallback down".to_string()))
        );
    }

    // Test that canceling one waiter leaves the load and other waiters intact
    #[tokio::test]
    async fn test_dropped_waiter_does_not_disturb_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let cache = Arc::new(SingleFlight::new(gated_loader(
            calls.clone(),
            gate.clone(),
            11,
        )));

        let doomed = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get().await }
        });
        let survivor = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get().await }
        });

        // Wait until both waiters are attached to the flight, then cancel one
        while cache.stats().misses + cache.stats().coalesced < 2 {
            tokio::task::yield_now().await;
        }
        doomed.abort();
        gate.add_permits(1);

        assert_eq!(survivor.await.unwrap(), Ok(11));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The settled value remains cached for later callers
        assert_eq!(cache.get().await, Ok(11));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // Test that aborting the load surfaces as cancellation, bypassing the fallback
    #[tokio::test]
    async fn test_canceled_load_bypasses_fallback() {
        init_test_logs();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let cache = Arc::new(
            SingleFlight::new(gated_loader(calls.clone(), gate.clone(), 13))
                .with_fallback(|| async { Ok(99) }),
        );

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get().await }
        });

        // Wait for the loader to actually start, then abort it mid-load
        while calls.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        cache.invalidate().await;

        assert_eq!(waiter.await.unwrap(), Err(CacheError::Canceled));
        assert_eq!(cache.stats().fallbacks, 0);

        // The slot is clear; a later call loads normally
        gate.add_permits(2);
        assert_eq!(cache.get().await, Ok(13));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // Test that invalidating a cached value forces a reload
    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlight::new({
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) }
            }
        });

        assert_eq!(cache.get().await, Ok(0));
        cache.invalidate().await;
        assert_eq!(cache.peek().await, None);
        assert_eq!(cache.get().await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // Test that a loader panic is reported as a failure, not cached
    #[tokio::test]
    async fn test_loader_panic_surfaces_and_clears_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SingleFlight::new({
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("loader bug");
                    }
                    Ok(3)
                }
            }
        });

        match cache.get().await {
            Err(CacheError::Panicked(_)) => {}
            other => panic!("expected panic error, got {:?}", other),
        }
        assert_eq!(cache.get().await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
