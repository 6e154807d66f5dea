//! Compute function: produces the value for a key on a cache miss.
//!
//! The cache calls it with **no lock held**.  It may be slow, block on I/O,
//! or call back into the same cache.  Under contention several threads may
//! compute the same key at once; only one result is kept, so the function
//! should give equivalent values for equal keys.
//!
//! # Example
//! ```
//! use weakcache::WeakCache;
//! use std::sync::Arc;
//!
//! let lengths = WeakCache::builder()
//!     .build_fn(|path: &String| std::fs::metadata(path).map(|m| m.len()));
//!
//! let missing = Arc::new("/definitely/not/here".to_string());
//! assert!(lengths.get(&missing).is_err());
//! ```

use std::convert::Infallible;

/// Computes the value cached for a key.
///
/// Returning an error caches nothing; the error reaches the caller of
/// [`WeakCache::get`](crate::WeakCache::get) wrapped in
/// [`Error::Compute`](crate::Error::Compute), and the next lookup tries
/// again.
pub trait Compute<K, V>: Send + Sync + 'static {
    type Error;

    fn compute(&self, key: &K) -> Result<V, Self::Error>;
}

// ---------------------------------------------------------------------------
// Built-in implementations
// ---------------------------------------------------------------------------

/// A fallible compute function backed by a closure.
///
/// Created via [`WeakCacheBuilder::build_fn`](crate::WeakCacheBuilder::build_fn).
pub struct FnCompute<F>(pub F);

impl<K, V, E, F> Compute<K, V> for FnCompute<F>
where
    F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
{
    type Error = E;

    #[inline]
    fn compute(&self, key: &K) -> Result<V, E> {
        (self.0)(key)
    }
}

/// A compute function that cannot fail.
///
/// Created via [`WeakCacheBuilder::build_infallible`](crate::WeakCacheBuilder::build_infallible).
pub struct InfallibleFn<F>(pub F);

impl<K, V, F> Compute<K, V> for InfallibleFn<F>
where
    F: Fn(&K) -> V + Send + Sync + 'static,
{
    type Error = Infallible;

    #[inline]
    fn compute(&self, key: &K) -> Result<V, Infallible> {
        Ok((self.0)(key))
    }
}
