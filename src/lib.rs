//! A concurrent memoizing cache with weakly held keys.
//!
//! [`WeakCache`] maps `Arc<K>` keys to values produced by a user-supplied
//! [`Compute`] function.  The cache never keeps a key alive: when the last
//! `Arc` of a key is dropped its entry disappears, and a later lookup with
//! an equal key simply computes the value again.
//!
//! Values are computed outside every cache lock, so a slow computation never
//! blocks other lookups.  The price is that concurrent misses on the same
//! key may compute it more than once; only the first result is cached.

mod builder;
mod cache;
mod error;
mod metrics;
mod store;
pub mod compute;
pub mod listener;

pub use builder::WeakCacheBuilder;
pub use cache::WeakCache;
pub use compute::Compute;
pub use error::Error;
pub use metrics::stats::Metrics;
