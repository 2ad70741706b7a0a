// =============================================================================
// Result Cache: single-flight, TTL-bounded, LRU-evicting
// =============================================================================
//
// `get_or_compute(key, producer)`:
//   - fresh entry         => hit, returned without running the producer
//   - computation running => join: await the same shared future
//   - otherwise           => miss: run the producer once, share its outcome
//
// The shared future stores a successful result and clears the in-flight slot
// itself, so the value lands in the cache even if the caller that started it
// goes away. Failures reach every joined caller and are not stored.
//
// All map mutation happens under one lock; the lock is never held across an
// await.
// =============================================================================

pub mod disk;

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

pub use disk::DiskStore;

type InFlight<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_access: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    in_flight: HashMap<K, InFlight<V>>,
    /// Monotonic access counter for LRU ordering.
    tick: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub in_flight: usize,
    pub capacity: usize,
}

pub struct ResultCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    counters: Arc<Counters>,
    capacity: usize,
    default_ttl: Duration,
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                tick: 0,
            })),
            counters: Arc::new(Counters::default()),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    pub async fn get_or_compute<F, Fut>(&self, key: K, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let ttl = self.default_ttl;
        self.get_or_compute_expiring(key, move || {
            let work = producer();
            async move { work.await.map(|value| (value, ttl)) }
        })
        .await
    }

    /// Like `get_or_compute`, but the producer also says how long its value
    /// stays fresh (e.g. what is left of an entry restored from disk).
    pub async fn get_or_compute_expiring<F, Fut>(&self, key: K, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, Duration)>> + Send + 'static,
    {
        let shared = {
            let mut inner = self.inner.lock();
            if let Some(value) = self.lookup(&mut inner, &key) {
                return Ok(value);
            }

            match inner.in_flight.get(&key) {
                Some(running) => {
                    self.counters.joins.fetch_add(1, Ordering::Relaxed);
                    debug!(key = ?key, "joining in-flight computation");
                    running.clone()
                }
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(key = ?key, "cache miss, computing");
                    let shared = self.spawn_shared(key.clone(), producer());
                    inner.in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            joins: self.counters.joins.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            in_flight: inner.in_flight.len(),
            capacity: self.capacity,
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn lookup(&self, inner: &mut Inner<K, V>, key: &K) -> Option<V> {
        let now = Instant::now();
        inner.tick += 1;
        let tick = inner.tick;

        match inner.entries.get_mut(key) {
            None => return None,
            Some(entry) if entry.expires_at > now => {
                entry.last_access = tick;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        inner.entries.remove(key);
        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        debug!(key = ?key, "cache entry expired");
        None
    }

    fn spawn_shared<Fut>(&self, key: K, work: Fut) -> InFlight<V>
    where
        Fut: Future<Output = Result<(V, Duration)>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let counters = Arc::clone(&self.counters);
        let capacity = self.capacity;

        async move {
            let result = work.await;
            let mut guard = inner.lock();
            guard.in_flight.remove(&key);
            result.map(|(value, ttl)| {
                store(&mut guard, &counters, capacity, key, value.clone(), ttl);
                value
            })
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Fresh value for `key`, if cached. Counts as an access.
    fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        self.lookup(&mut inner, key)
    }

    fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock();
        store(&mut inner, &self.counters, self.capacity, key, value, ttl);
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

fn store<K, V>(
    inner: &mut Inner<K, V>,
    counters: &Counters,
    capacity: usize,
    key: K,
    value: V,
    ttl: Duration,
) where
    K: Eq + Hash + Clone + Debug,
{
    let now = Instant::now();
    if !inner.entries.contains_key(&key) && inner.entries.len() >= capacity {
        // Expired entries go first.
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        let purged = before - inner.entries.len();
        if purged > 0 {
            counters
                .expirations
                .fetch_add(purged as u64, Ordering::Relaxed);
        }

        if inner.entries.len() >= capacity {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
                counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = ?victim, "evicted least recently used entry");
            }
        }
    }

    inner.tick += 1;
    let entry = Entry {
        value,
        expires_at: now + ttl,
        last_access: inner.tick,
    };
    inner.entries.insert(key, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicU32;

    fn cache(capacity: usize) -> ResultCache<String, u32> {
        ResultCache::new(capacity, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn second_call_is_a_hit() {
        let cache = cache(4);
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let v = cache
                .get_or_compute("k".into(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(v, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(cache(4));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("btc".into(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.joins + stats.hits, 7);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn failures_are_shared_but_not_cached() {
        let cache = cache(4);
        let err = cache
            .get_or_compute("k".into(), || async { Err(Error::InvalidSymbol("K".into())) })
            .await;
        assert_eq!(err, Err(Error::InvalidSymbol("K".into())));
        assert!(cache.is_empty());

        let ok = cache.get_or_compute("k".into(), || async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = cache(4);
        cache.insert("k".into(), 1, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get(&"k".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted() {
        let cache = cache(2);
        cache.insert("a".into(), 1, Duration::from_secs(60));
        cache.insert("b".into(), 2, Duration::from_secs(60));
        // Touch "a" so "b" becomes the LRU entry.
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.insert("c".into(), 3, Duration::from_secs(60));

        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"c".to_string()), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_purged_before_eviction() {
        let cache = cache(2);
        cache.insert("old".into(), 1, Duration::from_secs(1));
        cache.insert("live".into(), 2, Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(5)).await;

        cache.insert("new".into(), 3, Duration::from_secs(60));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
        assert_eq!(cache.get(&"live".to_string()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn producer_chosen_ttl_overrides_the_default() {
        let cache = cache(4);
        let v = cache
            .get_or_compute_expiring("k".into(), || async { Ok((5, Duration::from_secs(3))) })
            .await;
        assert_eq!(v, Ok(5));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"k".to_string()), Some(5));

        // Default TTL is 60 s; the producer's 3 s wins.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_first_caller_still_fills_the_cache() {
        let cache = Arc::new(cache(4));

        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k".into(), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(9)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k".into(), || async { Ok(0) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        assert_eq!(second.await.unwrap(), Ok(9));
        assert_eq!(cache.get(&"k".to_string()), Some(9));
    }
}
