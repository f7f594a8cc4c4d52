//! Expiring key/value cache with single-flight recomputation.
//!
//! Each key owns a slot guarded by an async read/write lock. Readers take the
//! shared lock and return a fresh value if there is one. Otherwise they take the
//! exclusive lock, re-check, and recompute while still holding it, so at most
//! one recompute per key is ever in flight and everyone queued behind it sees
//! its result.
//!
//! A failed recompute is handed to every caller that was already waiting when
//! it started, but it is never stored: the next caller to arrive retries.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use peruse_core::{Clock, PeruseError, SystemClock};
use tokio::sync::RwLock;

use super::config::CacheConfig;
use super::lock::mutex_lock;

/// A computed value and the instant it stops being served.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Option<DateTime<Utc>>,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

struct SlotState<V, E> {
    entry: Option<CacheEntry<V>>,
    /// Failure of the most recent recompute, tagged with its generation.
    failure: Option<(u64, E)>,
}

struct Slot<V, E> {
    /// Incremented each time a recompute completes.
    generation: AtomicU64,
    state: RwLock<SlotState<V, E>>,
}

impl<V, E> Default for Slot<V, E> {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            state: RwLock::new(SlotState {
                entry: None,
                failure: None,
            }),
        }
    }
}

/// Generic expiring cache.
///
/// `get_or_compute` is the only way values enter the cache. Slots evicted by
/// the capacity bound while a recompute is running finish normally; a caller
/// arriving after the eviction starts a fresh slot.
pub struct TtlCache<K, V, E = PeruseError> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    slots: Mutex<LruCache<K, Arc<Slot<V, E>>>>,
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let slots = match config.capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            config,
            clock,
            slots: Mutex::new(slots),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of key slots currently held.
    pub fn len(&self) -> usize {
        mutex_lock(&self.slots, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the fresh value for `key` without computing anything.
    pub async fn get(&self, key: &K) -> Option<V> {
        let slot = mutex_lock(&self.slots, "get").peek(key).cloned()?;
        let state = slot.state.read().await;
        let now = self.clock.now();
        state
            .entry
            .as_ref()
            .filter(|e| e.is_fresh(now))
            .map(|e| e.value.clone())
    }

    /// Return the cached value for `key`, computing it if absent or expired.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        let observed = slot.generation.load(Ordering::Acquire);

        {
            let state = slot.state.read().await;
            if let Some(value) = fresh_value(&state, self.clock.now()) {
                return Ok(value);
            }
        }

        let mut state = slot.state.write().await;
        if let Some(value) = fresh_value(&state, self.clock.now()) {
            return Ok(value);
        }

        let current = slot.generation.load(Ordering::Acquire);
        if current != observed {
            if let Some((generation, err)) = &state.failure {
                if *generation == current {
                    return Err(err.clone());
                }
            }
        }

        let result = compute().await;
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        match result {
            Ok(value) => {
                state.entry = Some(CacheEntry {
                    value: value.clone(),
                    expires_at: self.expiry(),
                });
                state.failure = None;
                Ok(value)
            }
            Err(err) => {
                state.failure = Some((generation, err.clone()));
                Err(err)
            }
        }
    }

    fn slot(&self, key: K) -> Arc<Slot<V, E>> {
        let mut slots = mutex_lock(&self.slots, "slot");
        if let Some(slot) = slots.get(&key) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot::default());
        slots.put(key, Arc::clone(&slot));
        slot
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        let ttl = self.config.ttl?;
        let ttl = ChronoDuration::from_std(ttl).ok()?;
        self.clock.now().checked_add_signed(ttl)
    }
}

fn fresh_value<V: Clone, E>(state: &SlotState<V, E>, now: DateTime<Utc>) -> Option<V> {
    state
        .entry
        .as_ref()
        .filter(|e| e.is_fresh(now))
        .map(|e| e.value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use peruse_core::{ManualClock, StorageError};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn cache_with_clock(ttl: Option<Duration>) -> (TtlCache<String, u32>, ManualClock) {
        let clock = ManualClock::epoch_2024();
        let mut config = CacheConfig::new();
        config.ttl = ttl;
        (TtlCache::with_clock(config, Arc::new(clock.clone())), clock)
    }

    fn query_failed(reason: &str) -> PeruseError {
        StorageError::QueryFailed {
            reason: reason.to_string(),
        }
        .into()
    }

    #[tokio::test]
    async fn test_fresh_value_is_served_without_recompute() {
        let (cache, _clock) = cache_with_clock(Some(Duration::from_secs(60)));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let v = cache
                .get_or_compute("k".to_string(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(v, 7);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_value_is_recomputed() {
        let (cache, clock) = cache_with_clock(Some(Duration::from_secs(60)));

        let first = cache
            .get_or_compute("k".to_string(), || async { Ok(1) })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get(&"k".to_string()).await, Some(1));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"k".to_string()).await, None);
        let second = cache
            .get_or_compute("k".to_string(), || async { Ok(2) })
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_no_ttl_never_expires() {
        let (cache, clock) = cache_with_clock(None);
        cache
            .get_or_compute("k".to_string(), || async { Ok(1) })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        assert_eq!(cache.get(&"k".to_string()).await, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_recompute() {
        let cache = Arc::new(TtlCache::<String, u32>::new(
            CacheConfig::new().with_ttl(Duration::from_secs(60)),
        ));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute("hot".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            })
        });

        for result in join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_share_failure_and_next_caller_retries() {
        let (cache, _clock) = cache_with_clock(Some(Duration::from_secs(60)));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let cache = &cache;

        let attempt = move || {
            cache.get_or_compute("k".to_string(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<u32, _>(query_failed("store down"))
            })
        };

        let results = join_all((0..4).map(|_| attempt())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in &results {
            assert_eq!(result.as_ref().unwrap_err(), &query_failed("store down"));
        }

        let retried = cache
            .get_or_compute("k".to_string(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            })
            .await;
        assert_eq!(retried.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_nothing_fresh() {
        let (cache, clock) = cache_with_clock(Some(Duration::from_secs(10)));
        cache
            .get_or_compute("k".to_string(), || async { Ok(1) })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));

        let failed = cache
            .get_or_compute("k".to_string(), || async { Err(query_failed("boom")) })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(CacheConfig::new().with_capacity(2));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move |v: u32| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, PeruseError>(v)
            }
        };

        cache.get_or_compute("a", compute(1)).await.unwrap();
        cache.get_or_compute("b", compute(2)).await.unwrap();
        cache.get_or_compute("a", compute(1)).await.unwrap();
        cache.get_or_compute("c", compute(3)).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // "b" was least recently used.
        assert_eq!(cache.get(&"b").await, None);
        assert_eq!(cache.get(&"a").await, Some(1));
        cache.get_or_compute("b", compute(2)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        #[test]
        fn prop_value_never_served_past_ttl(ttl_secs in 1u64..1_000, elapsed in 0u64..2_000) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (cache, clock) = cache_with_clock(Some(Duration::from_secs(ttl_secs)));
            let served = rt.block_on(async {
                cache
                    .get_or_compute("k".to_string(), || async { Ok(1) })
                    .await
                    .unwrap();
                clock.advance(Duration::from_secs(elapsed));
                cache.get(&"k".to_string()).await
            });
            proptest::prop_assert_eq!(served.is_some(), elapsed < ttl_secs);
        }
    }
}
