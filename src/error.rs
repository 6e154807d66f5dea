use std::time::Duration;

use crate::store::sharded::Elapsed;

/// Why a cache lookup produced no value.
///
/// `E` is the error type of the cache's [`Compute`](crate::Compute)
/// function.  Neither variant leaves anything cached or any lock held.
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// The compute function failed for the requested key.
    #[error("failed to compute the value for a cache miss")]
    Compute(#[source] E),
    /// A shard lock was not granted within the timeout passed to
    /// [`WeakCache::get_timeout`](crate::WeakCache::get_timeout).
    #[error("timed out after {0:?} waiting for a cache lock")]
    LockTimeout(Duration),
}

impl<E> Error<E> {
    /// Returns the compute error, if that is what this is.
    pub fn into_compute(self) -> Option<E> {
        match self {
            Error::Compute(e) => Some(e),
            Error::LockTimeout(_) => None,
        }
    }
}

impl<E> From<Elapsed> for Error<E> {
    fn from(Elapsed(timeout): Elapsed) -> Self {
        Error::LockTimeout(timeout)
    }
}
