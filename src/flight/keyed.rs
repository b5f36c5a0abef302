use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use lru::LruCache;
use tokio::sync::Mutex;

use crate::core::error::Result;
use crate::core::stats::{FlightStats, StatsSnapshot};
use crate::flight::group::FlightGroup;

/// Producer invoked to (re)compute the value for one key
type KeyedLoader<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Per-key success cache with single-flight loads
///
/// Each key behaves like its own [`SingleFlight`] slot: concurrent callers
/// for one key share a single load, a success is cached until invalidated or
/// evicted, a failure is never cached, and an optional fallback answers
/// failed calls without entering the cache.
///
/// Two store shapes are available: an unbounded concurrent map, or a bounded
/// LRU store that evicts the least recently used value when capacity is
/// reached. An evicted value simply reloads on its next `get`.
///
/// [`SingleFlight`]: crate::flight::single_flight::SingleFlight
pub struct KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Cached successes by key
    store: Store<K, V>,
    /// Coalesces concurrent loads per key
    group: FlightGroup<K, V>,
    /// Producer for cache misses
    loader: KeyedLoader<K, V>,
    /// Optional producer consulted on load failure; its result is not cached
    fallback: Option<KeyedLoader<K, V>>,
    /// Activity counters
    stats: FlightStats,
}

/// Backing store for cached successes
enum Store<K, V> {
    /// Concurrent map with no eviction
    Unbounded(DashMap<K, V>),
    /// LRU store evicting beyond a fixed capacity
    Bounded(Mutex<LruCache<K, V>>),
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an unbounded cache around the given per-key loader
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        Self::with_store(Store::Unbounded(DashMap::new()), loader)
    }

    /// Create a bounded cache evicting least recently used values beyond
    /// `capacity`
    pub fn bounded<F, Fut>(capacity: NonZeroUsize, loader: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        Self::with_store(Store::Bounded(Mutex::new(LruCache::new(capacity))), loader)
    }

    fn with_store<F, Fut>(store: Store<K, V>, loader: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        Self {
            store,
            group: FlightGroup::new(),
            loader: Arc::new(move |key| loader(key).boxed()),
            fallback: None,
            stats: FlightStats::new(),
        }
    }

    /// Configure a fallback producer consulted when a load fails.
    ///
    /// Same contract as the single-slot cache: the fallback result is
    /// returned but never cached, and cancellation bypasses it.
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |key| fallback(key).boxed()));
        self
    }

    /// Return the value for `key`, joining or starting a load as needed
    pub async fn get(&self, key: K) -> Result<V> {
        if let Some(value) = self.lookup(&key).await {
            self.stats.record_hit();
            return Ok(value);
        }

        let loader = Arc::clone(&self.loader);
        let load_key = key.clone();
        let (led, generation, flight) = self
            .group
            .begin(key.clone(), move || (loader.as_ref())(load_key));
        // A store miss that joins an existing flight is a coalesced call,
        // not a fresh miss.
        if led {
            self.stats.record_miss();
        } else {
            self.stats.record_coalesced();
        }
        let outcome = self.group.finish(&key, generation, flight).await;

        match outcome {
            Ok(value) => {
                self.insert(key, value.clone()).await;
                Ok(value)
            }
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                self.stats.record_failure();
                match &self.fallback {
                    Some(fallback) => {
                        warn!("keyed load failed, serving fallback: {}", err);
                        self.stats.record_fallback();
                        (fallback.as_ref())(key).await
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Non-loading read of the cached value for `key`.
    ///
    /// Does not refresh LRU recency in the bounded store.
    pub async fn peek(&self, key: &K) -> Option<V> {
        match &self.store {
            Store::Unbounded(map) => map.get(key).map(|entry| entry.value().clone()),
            Store::Bounded(lru) => lru.lock().await.peek(key).cloned(),
        }
    }

    /// Drop the cached value for `key`, if any.
    ///
    /// A load already in flight for the key is not interrupted and will cache
    /// its result normally.
    pub async fn invalidate(&self, key: &K) {
        let removed = match &self.store {
            Store::Unbounded(map) => map.remove(key).is_some(),
            Store::Bounded(lru) => lru.lock().await.pop(key).is_some(),
        };
        if removed {
            debug!("invalidated cached entry");
        }
    }

    /// Drop every cached value
    pub async fn invalidate_all(&self) {
        debug!("clearing keyed cache: {}", self.stats.snapshot().to_json());
        match &self.store {
            Store::Unbounded(map) => map.clear(),
            Store::Bounded(lru) => lru.lock().await.clear(),
        }
    }

    /// Number of cached values
    pub async fn len(&self) -> usize {
        match &self.store {
            Store::Unbounded(map) => map.len(),
            Store::Bounded(lru) => lru.lock().await.len(),
        }
    }

    /// Whether the cache holds no values
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Capture the current activity counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Read from the store, refreshing LRU recency on a bounded hit
    async fn lookup(&self, key: &K) -> Option<V> {
        match &self.store {
            Store::Unbounded(map) => map.get(key).map(|entry| entry.value().clone()),
            Store::Bounded(lru) => lru.lock().await.get(key).cloned(),
        }
    }

    /// Record a successful load in the store
    async fn insert(&self, key: K, value: V) {
        match &self.store {
            Store::Unbounded(map) => {
                map.insert(key, value);
            }
            Store::Bounded(lru) => {
                lru.lock().await.put(key, value);
            }
        }
    }
}
