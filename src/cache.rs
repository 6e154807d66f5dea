use std::convert::Infallible;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::builder::WeakCacheBuilder;
use crate::compute::Compute;
use crate::error::Error;
use crate::listener::{RemovalCause, RemovalListener};
use crate::metrics::stats::{Metrics, StatsCounter};
use crate::store::sharded::{ShardedStore, Wait};

// ---------------------------------------------------------------------------
// Cache interior
// ---------------------------------------------------------------------------

/// Shared interior of a [`WeakCache`].
pub(crate) struct Inner<K, V, E> {
    pub(crate) store: ShardedStore<K, V>,
    pub(crate) compute: Box<dyn Compute<K, V, Error = E>>,
    /// Optional removal listener.  `None` if the user didn't register one.
    pub(crate) listener: Option<Box<dyn RemovalListener<K, V>>>,
    pub(crate) metrics: StatsCounter,
}

// ---------------------------------------------------------------------------
// Cache handle
// ---------------------------------------------------------------------------

/// A concurrent memoizing cache whose keys are held weakly.
///
/// Callers own keys as `Arc<K>`; the cache keeps only a `Weak<K>`.  Once
/// the last `Arc` of a key is dropped its entry is gone, and the next
/// [`get`](WeakCache::get) with an equal key computes the value again.
///
/// The compute function never runs under a cache lock.  Two threads that
/// miss on the same key at the same time may both compute it; the first to
/// publish wins and the other result is handed back to its caller without
/// being cached.
///
/// # Example
/// ```
/// use weakcache::WeakCache;
/// use std::sync::Arc;
///
/// let cache = WeakCache::builder().build_infallible(|s: &String| s.len());
///
/// let key = Arc::new("hello".to_string());
/// assert_eq!(*cache.get(&key).unwrap(), 5);
/// assert!(cache.contains(&key));
///
/// drop(key);
/// assert!(!cache.contains(&"hello".to_string()));
/// ```
pub struct WeakCache<K, V, E = Infallible> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for WeakCache<K, V, E> {
    fn clone(&self) -> Self {
        WeakCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> WeakCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Returns a [`WeakCacheBuilder`] for constructing a new cache.
    pub fn builder() -> WeakCacheBuilder<K, V> {
        WeakCacheBuilder::new()
    }
}

impl<K, V, E> WeakCache<K, V, E>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: 'static,
{
    /// Creates a cache with default settings around `compute`.
    pub fn new<C>(compute: C) -> Self
    where
        C: Compute<K, V, Error = E>,
    {
        WeakCacheBuilder::new().build(compute)
    }

    pub(crate) fn from_parts(
        num_shards: usize,
        compute: Box<dyn Compute<K, V, Error = E>>,
        listener: Option<Box<dyn RemovalListener<K, V>>>,
    ) -> Self {
        WeakCache {
            inner: Arc::new(Inner {
                store: ShardedStore::new(num_shards),
                compute,
                listener,
                metrics: StatsCounter::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Returns the value for `key`, computing and caching it on a miss.
    ///
    /// A hit only takes the key's shard lock in shared mode.  On a miss the
    /// shared lock is released, the compute function runs with no lock held,
    /// and the result is published under the exclusive lock unless another
    /// thread got there first, in which case that thread's value is returned.
    ///
    /// The compute function may call back into this cache.
    pub fn get(&self, key: &Arc<K>) -> Result<Arc<V>, Error<E>> {
        self.lookup(key, Wait::Block)
    }

    /// Like [`get`](WeakCache::get), but waits at most `timeout` for each
    /// lock acquisition.
    ///
    /// Returns [`Error::LockTimeout`] if a lock is not granted in time.  When
    /// that happens after computing, the fresh value is dropped uncached.
    pub fn get_timeout(&self, key: &Arc<K>, timeout: Duration) -> Result<Arc<V>, Error<E>> {
        self.lookup(key, Wait::For(timeout))
    }

    fn lookup(&self, key: &Arc<K>, wait: Wait) -> Result<Arc<V>, Error<E>> {
        let inner = &*self.inner;

        if let Some(value) = inner.store.get(key, wait)? {
            inner.metrics.record_hit();
            return Ok(value);
        }

        // Shared lock already dropped: compute with nothing held.
        inner.metrics.record_miss();
        debug!("cache miss, computing value");
        let value = match inner.compute.compute(key) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                inner.metrics.record_failure();
                debug!("compute failed, nothing cached");
                return Err(Error::Compute(e));
            }
        };

        match inner.store.publish(key, &value, wait)? {
            None => Ok(value),
            Some(current) => {
                inner.metrics.record_discard();
                debug!("another thread cached this key first, discarding computed value");
                self.notify(key, value, RemovalCause::Discarded);
                Ok(current)
            }
        }
    }

    /// Returns the cached value for `key` without computing on a miss.
    ///
    /// Does not count towards hit/miss statistics.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.inner.store.peek(key)
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Removes the entry for `key`, returning its value if one was cached.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let removed = self.inner.store.remove(key)?;
        self.notify(key, Arc::clone(&removed), RemovalCause::Explicit);
        Some(removed)
    }

    /// Removes all entries.
    ///
    /// Every shard is emptied under its exclusive lock.  Concurrent lookups
    /// either see an entry from before the clear or recompute.
    pub fn clear(&self) {
        if self.inner.listener.is_some() {
            let drained = self.inner.store.drain();
            debug!("cleared {} live entries", drained.len());
            for (key, value) in drained {
                self.notify(&key, value, RemovalCause::Cleared);
            }
        } else {
            self.inner.store.clear();
            debug!("cleared cache");
        }
    }

    /// Reclaims the slots of entries whose key has been dropped.
    ///
    /// Dead entries are never returned, and each shard sweeps them on its
    /// own once it has served about as many operations as it holds slots;
    /// this makes the sweep happen now.  Returns how many slots were
    /// reclaimed.
    pub fn purge_collected(&self) -> usize {
        let reclaimed = self.inner.store.purge();
        if reclaimed > 0 {
            debug!("reclaimed {reclaimed} entries with collected keys");
        }
        reclaimed
    }

    /// Hands `value` to the listener.  Must not be called with a lock held.
    fn notify(&self, key: &K, value: Arc<V>, cause: RemovalCause) {
        if let Some(listener) = &self.inner.listener {
            listener.on_remove(key, value, cause);
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Metrics {
        self.inner.metrics.snapshot()
    }

    /// Number of entries whose key is still alive.
    pub fn entry_count(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.store.contains(key)
    }

    pub fn num_shards(&self) -> usize {
        self.inner.store.num_shards()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache(shards: usize) -> (WeakCache<String, usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = WeakCache::builder()
            .num_shards(shards)
            .build_infallible(move |key: &String| {
                counter.fetch_add(1, Ordering::SeqCst);
                key.len()
            });
        (cache, calls)
    }

    #[test]
    fn hit_does_not_recompute() {
        let (cache, calls) = counting_cache(1);
        let key = Arc::new("abc".to_string());
        for _ in 0..5 {
            assert_eq!(*cache.get(&key).unwrap(), 3);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn hits_return_the_same_allocation() {
        let (cache, _) = counting_cache(2);
        let key = Arc::new("abc".to_string());
        let first = cache.get(&key).unwrap();
        let second = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn peek_never_computes() {
        let (cache, calls) = counting_cache(4);
        let key = Arc::new("abc".to_string());
        assert_eq!(cache.peek(&key), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache.get(&key).unwrap();
        assert_eq!(cache.peek(&key), Some(Arc::new(3)));
        assert_eq!(cache.stats().request_count(), 1);
    }

    #[test]
    fn clones_share_entries() {
        let (c1, calls) = counting_cache(4);
        let c2 = c1.clone();
        let key = Arc::new("shared".to_string());
        c1.get(&key).unwrap();
        c2.get(&key).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_shard_layout() {
        let (cache, _) = counting_cache(1);
        assert_eq!(cache.num_shards(), 1);
        let keys: Vec<_> = (0..10).map(|i| Arc::new(i.to_string())).collect();
        for k in &keys {
            cache.get(k).unwrap();
        }
        assert_eq!(cache.entry_count(), 10);
    }

    #[test]
    fn timeout_on_shared_lock() {
        let (cache, calls) = counting_cache(1);
        let key = Arc::new("abc".to_string());

        let guard = cache.inner.store.write_shard(&key);
        let err = cache
            .get_timeout(&key, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(d) if d == Duration::from_millis(20)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(guard);

        assert_eq!(*cache.get_timeout(&key, Duration::from_millis(20)).unwrap(), 3);
    }

    #[test]
    fn timeout_on_exclusive_lock_drops_computed_value() {
        let (cache, calls) = counting_cache(1);
        let key = Arc::new("abc".to_string());

        // A reader blocks the publish step but not the initial lookup.
        let guard = cache.inner.store.read_shard(&key);
        let err = cache
            .get_timeout(&key, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(guard);

        assert!(!cache.contains(&key));
        cache.get(&key).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_compute_leaves_no_lock_held() {
        let cache: WeakCache<u32, u32> = WeakCache::builder()
            .num_shards(1)
            .build_infallible(|n: &u32| {
                assert!(*n != 0, "zero is not allowed");
                n + 1
            });

        let zero = Arc::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cache.get(&zero)));
        assert!(result.is_err());

        let one = Arc::new(1);
        assert_eq!(*cache.get(&one).unwrap(), 2);
        assert!(cache.get_timeout(&one, Duration::from_millis(20)).is_ok());
    }
}
