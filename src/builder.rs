use std::convert::Infallible;
use std::hash::Hash;
use std::sync::Arc;

use crate::cache::WeakCache;
use crate::compute::{Compute, FnCompute, InfallibleFn};
use crate::listener::{FnListener, RemovalCause, RemovalListener};

/// Builder for configuring and constructing a [`WeakCache`].
///
/// The compute function is supplied last, by whichever `build*` method fits
/// its shape.
///
/// # Example
/// ```
/// use weakcache::WeakCacheBuilder;
/// use std::sync::Arc;
///
/// let squares = WeakCacheBuilder::new()
///     .num_shards(4)
///     .build_infallible(|n: &u64| n * n);
///
/// assert_eq!(*squares.get(&Arc::new(12)).unwrap(), 144);
/// ```
pub struct WeakCacheBuilder<K, V> {
    num_shards: usize,
    listener: Option<Box<dyn RemovalListener<K, V>>>,
}

impl<K: 'static, V: 'static> WeakCacheBuilder<K, V> {
    pub fn new() -> Self {
        WeakCacheBuilder {
            num_shards: 16,
            listener: None,
        }
    }

    /// Set the number of internal shards (must be a power of two; default: 16).
    ///
    /// Each shard has its own reader-writer lock.  `1` puts every key behind
    /// a single lock.
    pub fn num_shards(mut self, n: usize) -> Self {
        assert!(n > 0 && n.is_power_of_two(), "num_shards must be a power of two");
        self.num_shards = n;
        self
    }

    /// Register a removal listener closure.
    ///
    /// The closure is called on the thread that removed or discarded the
    /// value, after the cache's locks are released.
    pub fn removal_listener<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, Arc<V>, RemovalCause) + Send + Sync + 'static,
    {
        self.listener = Some(Box::new(FnListener(f)));
        self
    }

    /// Register a removal listener via the [`RemovalListener`] trait.
    pub fn removal_listener_impl<L: RemovalListener<K, V>>(mut self, l: L) -> Self {
        self.listener = Some(Box::new(l));
        self
    }
}

impl<K: 'static, V: 'static> Default for WeakCacheBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WeakCacheBuilder<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Build a cache around any [`Compute`] implementation.
    pub fn build<C>(self, compute: C) -> WeakCache<K, V, C::Error>
    where
        C: Compute<K, V>,
        C::Error: 'static,
    {
        WeakCache::from_parts(self.num_shards, Box::new(compute), self.listener)
    }

    /// Build a cache whose compute function is a fallible closure.
    pub fn build_fn<F, E>(self, f: F) -> WeakCache<K, V, E>
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
        E: 'static,
    {
        self.build(FnCompute(f))
    }

    /// Build a cache whose compute function always succeeds.
    pub fn build_infallible<F>(self, f: F) -> WeakCache<K, V, Infallible>
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        self.build(InfallibleFn(f))
    }
}
