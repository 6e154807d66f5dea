//! Removal listener: a callback invoked whenever a value leaves the cache
//! or is turned away from it.
//!
//! # Example
//! ```
//! use weakcache::listener::RemovalCause;
//! use weakcache::WeakCacheBuilder;
//! use std::sync::{Arc, Mutex};
//!
//! let log: Arc<Mutex<Vec<(u64, RemovalCause)>>> = Arc::new(Mutex::new(Vec::new()));
//! let log2 = Arc::clone(&log);
//!
//! let cache = WeakCacheBuilder::new()
//!     .removal_listener(move |key: &u64, _val, cause| {
//!         log2.lock().unwrap().push((*key, cause));
//!     })
//!     .build_infallible(|key: &u64| key * 10);
//!
//! let key = Arc::new(1u64);
//! cache.get(&key).unwrap();
//! cache.remove(&key);
//! assert_eq!(log.lock().unwrap()[0], (1, RemovalCause::Explicit));
//! ```
//!
//! Keys that are collected (their last `Arc` dropped) are never reported:
//! by the time the slot is reclaimed the key no longer exists.

use std::sync::Arc;

// ---------------------------------------------------------------------------
// RemovalCause
// ---------------------------------------------------------------------------

/// The reason a value was handed to the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalCause {
    /// Removed via [`WeakCache::remove`].
    ///
    /// [`WeakCache::remove`]: crate::WeakCache::remove
    Explicit,
    /// Removed via [`WeakCache::clear`].
    ///
    /// [`WeakCache::clear`]: crate::WeakCache::clear
    Cleared,
    /// Freshly computed, but another thread cached a value for the same key
    /// first.  The value was returned to its caller and never stored.
    Discarded,
}

// ---------------------------------------------------------------------------
// RemovalListener trait
// ---------------------------------------------------------------------------

/// A callback invoked each time a value is removed or discarded.
///
/// The callback runs synchronously on the thread that caused the removal,
/// after every cache lock has been released, so it may call back into the
/// cache.
pub trait RemovalListener<K, V>: Send + Sync + 'static {
    fn on_remove(&self, key: &K, value: Arc<V>, cause: RemovalCause);
}

/// A [`RemovalListener`] backed by a closure.
///
/// Created via [`WeakCacheBuilder::removal_listener`](crate::WeakCacheBuilder::removal_listener).
pub struct FnListener<F>(pub F);

impl<K, V, F> RemovalListener<K, V> for FnListener<F>
where
    F: Fn(&K, Arc<V>, RemovalCause) + Send + Sync + 'static,
{
    fn on_remove(&self, key: &K, value: Arc<V>, cause: RemovalCause) {
        (self.0)(key, value, cause)
    }
}
