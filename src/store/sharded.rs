use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::RandomState;
use log::trace;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use weak_table::WeakKeyHashMap;

/// The per-shard map: keys held through `Weak`, values held strongly.
pub(crate) type WeakMap<K, V> = WeakKeyHashMap<Weak<K>, Slot<V>, RandomState>;

/// Operations a shard serves before its first sweep for collected keys.
/// Afterwards a sweep is due once the shard has served as many operations
/// as it held slots after the previous sweep.
const SWEEP_MIN_OPS: usize = 64;

// ---------------------------------------------------------------------------
// Lock waiting
// ---------------------------------------------------------------------------

/// How long a store operation may wait for a shard lock.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Wait {
    /// Block until the lock is granted.
    Block,
    /// Give up after the duration.
    For(Duration),
}

/// A shard lock could not be acquired within the allotted [`Wait::For`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Elapsed(pub(crate) Duration);

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// Values that left a shard map while its lock was held.
type Graveyard<V> = Arc<Mutex<Vec<Arc<V>>>>;

/// A stored value.
///
/// `weak-table` drops slots in place: on `remove`, `clear` and when a
/// collected key's bucket is reused or swept.  Dropping a slot parks a
/// handle to its value in the shard's graveyard, so the last reference
/// to a value is always released by [`Shard::bury`], outside the lock.
pub(crate) struct Slot<V> {
    value: Arc<V>,
    graveyard: Graveyard<V>,
}

impl<V> Drop for Slot<V> {
    fn drop(&mut self) {
        self.graveyard.lock().push(Arc::clone(&self.value));
    }
}

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// Cache-line padding to prevent false sharing between shards.
#[repr(align(64))]
pub(crate) struct Shard<K, V> {
    map: RwLock<WeakMap<K, V>>,
    graveyard: Graveyard<V>,
    /// Operations served since the last sweep.
    ops: AtomicUsize,
    /// Value of `ops` at which the next sweep is due.
    sweep_at: AtomicUsize,
}

impl<K: Eq + Hash, V> Shard<K, V> {
    fn new() -> Self {
        Shard {
            map: RwLock::new(WeakKeyHashMap::with_hasher(RandomState::new())),
            graveyard: Arc::new(Mutex::new(Vec::new())),
            ops: AtomicUsize::new(0),
            sweep_at: AtomicUsize::new(SWEEP_MIN_OPS),
        }
    }

    #[inline]
    fn read(&self, wait: Wait) -> Result<RwLockReadGuard<'_, WeakMap<K, V>>, Elapsed> {
        match wait {
            Wait::Block => Ok(self.map.read()),
            Wait::For(timeout) => self.map.try_read_for(timeout).ok_or_else(|| {
                trace!("gave up on shard read lock after {timeout:?}");
                Elapsed(timeout)
            }),
        }
    }

    #[inline]
    fn write(&self, wait: Wait) -> Result<RwLockWriteGuard<'_, WeakMap<K, V>>, Elapsed> {
        match wait {
            Wait::Block => Ok(self.map.write()),
            Wait::For(timeout) => self.map.try_write_for(timeout).ok_or_else(|| {
                trace!("gave up on shard write lock after {timeout:?}");
                Elapsed(timeout)
            }),
        }
    }

    fn slot(&self, value: &Arc<V>) -> Slot<V> {
        Slot {
            value: Arc::clone(value),
            graveyard: Arc::clone(&self.graveyard),
        }
    }

    /// Counts one operation.  Returns `true` once a sweep is due.
    #[inline]
    fn tick(&self) -> bool {
        self.ops.fetch_add(1, Ordering::Relaxed) + 1 >= self.sweep_at.load(Ordering::Relaxed)
    }

    /// Drops the slots of collected keys if a sweep is due.
    ///
    /// Must be called with the write lock held.
    fn sweep(&self, map: &mut WeakMap<K, V>) {
        if self.ops.load(Ordering::Relaxed) < self.sweep_at.load(Ordering::Relaxed) {
            return;
        }
        let before = map.len();
        map.remove_expired();
        self.ops.store(0, Ordering::Relaxed);
        self.sweep_at
            .store(map.len().max(SWEEP_MIN_OPS), Ordering::Relaxed);
        let reclaimed = before - map.len();
        if reclaimed > 0 {
            trace!("swept {reclaimed} collected slots");
        }
    }

    /// Sweeps from a read path, unless a writer holds or waits for the lock.
    fn try_sweep(&self) {
        if let Some(mut map) = self.map.try_write() {
            self.sweep(&mut map);
        }
        self.bury();
    }

    /// Releases the values parked by dropped slots.
    ///
    /// Must be called with no shard lock held: dropping a value may run
    /// arbitrary `Drop` code, which is free to call back into the cache.
    fn bury(&self) {
        let parked = std::mem::take(&mut *self.graveyard.lock());
        drop(parked);
    }
}

// ---------------------------------------------------------------------------
// ShardedStore
// ---------------------------------------------------------------------------

/// A weak-keyed key-value store backed by `N` independently-locked shards.
///
/// Every key lives in exactly one shard.  Reads take that shard's shared
/// lock, writes its exclusive lock.  Keys whose last `Arc` has been dropped
/// are invisible to every read.  Their slots are swept once a shard has
/// served about as many operations as it holds slots, or on
/// [`ShardedStore::purge`].  No value is ever dropped while a shard lock is
/// held.
pub(crate) struct ShardedStore<K, V> {
    shards: Box<[Shard<K, V>]>,
    /// Always `shards.len() - 1`; shards.len() is a power of two.
    shard_mask: usize,
    /// Hasher used only to compute shard indices.
    build_hasher: RandomState,
}

impl<K: Eq + Hash, V> ShardedStore<K, V> {
    pub(crate) fn new(num_shards: usize) -> Self {
        assert!(num_shards.is_power_of_two());
        let shards = (0..num_shards)
            .map(|_| Shard::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        ShardedStore {
            shards,
            shard_mask: num_shards - 1,
            build_hasher: RandomState::new(),
        }
    }

    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        let h = self.build_hasher.hash_one(key);
        // Use the high bits (better avalanche from ahash).
        &self.shards[((h >> 32) as usize) & self.shard_mask]
    }

    pub(crate) fn num_shards(&self) -> usize {
        self.shards.len()
    }

    // -----------------------------------------------------------------------
    // Core operations
    // -----------------------------------------------------------------------

    /// Returns the value for `key` if its key is still alive.
    pub(crate) fn get(&self, key: &K, wait: Wait) -> Result<Option<Arc<V>>, Elapsed> {
        let shard = self.shard(key);
        let value = shard.read(wait)?.get(key).map(|slot| Arc::clone(&slot.value));
        if shard.tick() {
            shard.try_sweep();
        }
        Ok(value)
    }

    /// Like [`get`](Self::get), blocking and without counting towards a
    /// sweep.
    pub(crate) fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key)
            .map
            .read()
            .get(key)
            .map(|slot| Arc::clone(&slot.value))
    }

    /// Inserts `value` for `key` unless a live entry already exists.
    ///
    /// The check and the insert happen under a single exclusive lock.
    /// Returns `Ok(None)` if `value` was stored, or `Ok(Some(current))` with
    /// the entry that was already present, in which case `value` is not
    /// stored.
    pub(crate) fn publish(
        &self,
        key: &Arc<K>,
        value: &Arc<V>,
        wait: Wait,
    ) -> Result<Option<Arc<V>>, Elapsed> {
        let shard = self.shard(key);
        let current = {
            let mut map = shard.write(wait)?;
            if shard.tick() {
                shard.sweep(&mut map);
            }
            let current = map.get(key.as_ref()).map(|slot| Arc::clone(&slot.value));
            if current.is_none() {
                map.insert(Arc::clone(key), shard.slot(value));
            }
            current
        };
        shard.bury();
        Ok(current)
    }

    /// Removes the entry for `key`.  Returns the removed value, if any.
    pub(crate) fn remove(&self, key: &K) -> Option<Arc<V>> {
        let shard = self.shard(key);
        let removed = {
            let mut map = shard.map.write();
            if shard.tick() {
                shard.sweep(&mut map);
            }
            map.remove(key).map(|slot| Arc::clone(&slot.value))
        };
        shard.bury();
        removed
    }

    /// Returns `true` if a live entry exists for `key`.
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.shard(key).map.read().contains_key(key)
    }

    /// Returns the number of live entries across all shards.
    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.map.read().iter().count())
            .sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.shards
            .iter()
            .all(|s| s.map.read().iter().next().is_none())
    }

    /// Removes all entries from every shard.
    ///
    /// Each shard is emptied under its exclusive lock.
    pub(crate) fn clear(&self) {
        for shard in self.shards.iter() {
            shard.map.write().clear();
            shard.bury();
        }
    }

    /// Removes all entries and returns the ones whose key was still alive.
    pub(crate) fn drain(&self) -> Vec<(Arc<K>, Arc<V>)> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            drained.extend(
                shard
                    .map
                    .write()
                    .drain()
                    .map(|(key, slot)| (key, Arc::clone(&slot.value))),
            );
            shard.bury();
        }
        drained
    }

    /// Drops every slot whose key has been collected.
    ///
    /// Returns the number of slots reclaimed.
    pub(crate) fn purge(&self) -> usize {
        let mut reclaimed = 0;
        for shard in self.shards.iter() {
            {
                let mut map = shard.map.write();
                let before = map.len();
                map.remove_expired();
                reclaimed += before - map.len();
            }
            shard.bury();
        }
        reclaimed
    }

    #[cfg(test)]
    pub(crate) fn read_shard(&self, key: &K) -> RwLockReadGuard<'_, WeakMap<K, V>> {
        self.shard(key).map.read()
    }

    #[cfg(test)]
    pub(crate) fn write_shard(&self, key: &K) -> RwLockWriteGuard<'_, WeakMap<K, V>> {
        self.shard(key).map.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    #[test]
    fn publish_then_get() {
        let store: ShardedStore<String, u32> = ShardedStore::new(4);
        let k = key("a");
        assert_eq!(store.publish(&k, &Arc::new(1), Wait::Block), Ok(None));
        assert_eq!(store.get(&k, Wait::Block), Ok(Some(Arc::new(1))));
        assert!(store.contains(&k));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn publish_keeps_first_writer() {
        let store: ShardedStore<String, u32> = ShardedStore::new(1);
        let k = key("a");
        store.publish(&k, &Arc::new(1), Wait::Block).unwrap();
        let existing = store.publish(&k, &Arc::new(2), Wait::Block).unwrap();
        assert_eq!(existing, Some(Arc::new(1)));
        assert_eq!(store.get(&k, Wait::Block).unwrap(), Some(Arc::new(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lookup_by_equal_key() {
        let store: ShardedStore<String, u32> = ShardedStore::new(2);
        let k = key("a");
        store.publish(&k, &Arc::new(7), Wait::Block).unwrap();
        assert_eq!(store.get(&"a".to_string(), Wait::Block).unwrap(), Some(Arc::new(7)));
    }

    #[test]
    fn dropped_key_is_invisible_and_purged() {
        let store: ShardedStore<String, u32> = ShardedStore::new(1);
        let kept = key("kept");
        let dropped = key("dropped");
        store.publish(&kept, &Arc::new(1), Wait::Block).unwrap();
        store.publish(&dropped, &Arc::new(2), Wait::Block).unwrap();

        drop(dropped);
        assert_eq!(store.get(&"dropped".to_string(), Wait::Block).unwrap(), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge(), 1);
        assert_eq!(store.purge(), 0);
        assert!(store.contains(&kept));
    }

    #[test]
    fn drain_returns_live_entries_only() {
        let store: ShardedStore<String, u32> = ShardedStore::new(2);
        let a = key("a");
        let b = key("b");
        store.publish(&a, &Arc::new(1), Wait::Block).unwrap();
        store.publish(&b, &Arc::new(2), Wait::Block).unwrap();
        drop(b);

        let drained = store.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(*drained[0].0, "a");
        assert!(store.is_empty());
    }

    #[test]
    fn reads_sweep_collected_slots() {
        let store: ShardedStore<String, u32> = ShardedStore::new(1);
        let kept = key("kept");
        let dropped = key("dropped");
        store.publish(&kept, &Arc::new(1), Wait::Block).unwrap();
        store.publish(&dropped, &Arc::new(2), Wait::Block).unwrap();
        drop(dropped);

        for _ in 0..SWEEP_MIN_OPS {
            store.get(&kept, Wait::Block).unwrap();
        }
        assert_eq!(store.shards[0].map.read().len(), 1);
        assert_eq!(store.purge(), 0);
    }

    #[test]
    fn removes_sweep_collected_slots() {
        let store: ShardedStore<String, u32> = ShardedStore::new(1);
        let dropped = key("dropped");
        let value = Arc::new(2);
        store.publish(&dropped, &value, Wait::Block).unwrap();
        drop(dropped);
        assert_eq!(Arc::strong_count(&value), 2);

        for i in 0..SWEEP_MIN_OPS {
            assert_eq!(store.remove(&format!("absent-{i}")), None);
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn sweep_waits_for_enough_operations() {
        let store: ShardedStore<String, u32> = ShardedStore::new(1);
        let kept = key("kept");
        let dropped = key("dropped");
        store.publish(&kept, &Arc::new(1), Wait::Block).unwrap();
        store.publish(&dropped, &Arc::new(2), Wait::Block).unwrap();
        drop(dropped);

        store.get(&kept, Wait::Block).unwrap();
        assert_eq!(store.shards[0].map.read().len(), 2);
        assert_eq!(store.purge(), 1);
    }

    #[test]
    fn remove_leaves_nothing_parked() {
        let store: ShardedStore<String, u32> = ShardedStore::new(1);
        let k = key("a");
        let value = Arc::new(1);
        store.publish(&k, &value, Wait::Block).unwrap();

        let removed = store.remove(&k).unwrap();
        assert!(Arc::ptr_eq(&removed, &value));
        assert_eq!(Arc::strong_count(&value), 2);
        assert!(store.shards[0].graveyard.lock().is_empty());
    }

    #[test]
    fn peek_sees_live_entries() {
        let store: ShardedStore<String, u32> = ShardedStore::new(2);
        let k = key("a");
        assert_eq!(store.peek(&k), None);
        store.publish(&k, &Arc::new(3), Wait::Block).unwrap();
        assert_eq!(store.peek(&k), Some(Arc::new(3)));
    }

    #[test]
    fn timed_read_gives_up_while_write_locked() {
        let store: ShardedStore<String, u32> = ShardedStore::new(1);
        let k = key("a");
        let _guard = store.shards[0].map.write();
        assert_eq!(
            store.get(&k, Wait::For(Duration::from_millis(10))),
            Err(Elapsed(Duration::from_millis(10)))
        );
    }
}
