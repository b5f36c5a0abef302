use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;

use crate::core::error::Result;
use crate::core::stats::{FlightStats, StatsSnapshot};
use crate::flight::{share_flight, SharedFlight};

/// Keyed call coalescing without result retention
///
/// `run` executes the supplied future only when no flight for the key is
/// active; otherwise the caller joins the existing flight and receives the
/// same outcome. Once a flight settles its entry is removed, so a call
/// arriving after completion executes again. Nothing is cached here; see
/// [`KeyedCache`](crate::flight::keyed::KeyedCache) for keyed retention.
///
/// Flights run as their own tasks: dropping a waiter cancels only that
/// waiter.
pub struct FlightGroup<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Active flights by key
    flights: DashMap<K, ActiveFlight<V>>,
    /// Monotonic flight counter, shared across keys
    generation: AtomicU64,
    /// Activity counters
    stats: FlightStats,
}

/// One in-flight load registered under a key
struct ActiveFlight<V> {
    generation: u64,
    flight: SharedFlight<V>,
}

impl<K, V> FlightGroup<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty group
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
            generation: AtomicU64::new(0),
            stats: FlightStats::new(),
        }
    }

    /// Execute `load` for `key`, coalescing with any flight already active.
    ///
    /// The closure is invoked only when this call leads a new flight; a
    /// coalesced caller's closure is dropped unused.
    pub async fn run<F, Fut>(&self, key: K, load: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (_led, generation, flight) = self.begin(key.clone(), load);
        self.finish(&key, generation, flight).await
    }

    /// Join the active flight for `key`, or lead a new one.
    ///
    /// Returns whether this call led, plus the flight to pass to `finish`.
    /// Counters are recorded here, at join time, so layered caches can
    /// mirror the led/joined distinction before the flight settles.
    pub(crate) fn begin<F, Fut>(&self, key: K, load: F) -> (bool, u64, SharedFlight<V>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (generation, flight, led) = match self.flights.entry(key) {
            Entry::Occupied(entry) => {
                let active = entry.get();
                (active.generation, active.flight.clone(), false)
            }
            Entry::Vacant(entry) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let handle = tokio::spawn(load());
                let flight = share_flight(handle);
                entry.insert(ActiveFlight {
                    generation,
                    flight: flight.clone(),
                });
                (generation, flight, true)
            }
        };

        if led {
            self.stats.record_miss();
            debug!("leading flight (generation {})", generation);
        } else {
            self.stats.record_coalesced();
            debug!("joining flight (generation {})", generation);
        }
        (led, generation, flight)
    }

    /// Await a flight obtained from `begin` and retire its entry
    pub(crate) async fn finish(
        &self,
        key: &K,
        generation: u64,
        flight: SharedFlight<V>,
    ) -> Result<V> {
        // The dashmap guard is released; await the shared outcome.
        let outcome = flight.await;

        // Retire the flight entry unless a newer flight already replaced it.
        self.flights
            .remove_if(key, |_, active| active.generation == generation);

        if let Err(err) = &outcome {
            if !err.is_cancellation() {
                self.stats.record_failure();
            }
        }
        outcome
    }

    /// Number of flights currently active
    pub fn active_flights(&self) -> usize {
        self.flights.len()
    }

    /// Capture the current activity counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<K, V> Default for FlightGroup<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
