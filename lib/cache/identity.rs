//! Path-keyed identity cache.
//!
//! Values are strong-owned [`Arc`]s. An entry is considered dead once the cache holds the only
//! reference to its value; dead entries are reclaimed by [`IdentityCache::try_clean_dead_entries`]
//! in least-recently-used order whenever the cache has grown past its soft capacity.
//!
//! Every insertion is stamped with a fresh generation number. Sweeps and compare-and-remove
//! only ever evict the exact incarnation they observed, so a value that was replaced in the
//! meantime is never dropped by a stale decision.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::trace;

struct Slot<V> {
    value: Arc<V>,
    generation: u64,
    last_access: AtomicU64,
}

/// Clears the sweep flag when a sweep finishes, including on unwind.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A concurrent map that keeps at most one value per key and lets unreferenced values go.
pub struct IdentityCache<K, V> {
    slots: scc::HashMap<K, Slot<V>>,
    capacity: usize,
    clock: AtomicU64,
    generations: AtomicU64,
    sweeping: AtomicBool,
}

impl<K, V> IdentityCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a cache that starts reclaiming unreferenced entries beyond `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: scc::HashMap::new(),
            capacity,
            clock: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            sweeping: AtomicBool::new(false),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `value` at `key`, returning the value it replaced.
    pub fn put(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let slot = Slot {
            value,
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            last_access: AtomicU64::new(self.tick()),
        };
        match self.slots.entry_sync(key) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                Some(std::mem::replace(occ.get_mut(), slot).value)
            }
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(slot);
                None
            }
        }
    }

    /// Returns the value at `key`, marking it as recently used.
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.tick();
        self.slots.read_sync(key, |_, slot| {
            slot.last_access.store(now, Ordering::Relaxed);
            Arc::clone(&slot.value)
        })
    }

    /// Removes whatever value is stored at `key`.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots.remove_sync(key).map(|(_, slot)| slot.value)
    }

    /// Removes the value at `key` only if it is `expected` (pointer identity).
    ///
    /// Returns `false` and leaves the cache untouched when another value has taken its place.
    pub fn remove_if_same<Q>(&self, key: &Q, expected: &Arc<V>) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots
            .remove_if_sync(key, |slot| Arc::ptr_eq(&slot.value, expected))
            .is_some()
    }

    /// Whether `value` is the current value at `key`.
    #[must_use]
    pub fn is_current<Q>(&self, key: &Q, value: &Arc<V>) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots
            .read_sync(key, |_, slot| Arc::ptr_eq(&slot.value, value))
            .unwrap_or(false)
    }

    /// A point-in-time copy of all values.
    #[must_use]
    pub fn values(&self) -> Vec<Arc<V>> {
        let mut values = Vec::with_capacity(self.slots.len());
        self.slots.iter_sync(|_, slot| {
            values.push(Arc::clone(&slot.value));
            true
        });
        values
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there is nothing to hold.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Evicts unreferenced entries, oldest first, until the cache is back within capacity.
    ///
    /// Never blocks: returns `None` when another sweep is already running, otherwise the number
    /// of evicted entries.
    pub fn try_clean_dead_entries(&self) -> Option<usize> {
        self.try_clean_dead_entries_except(|_| false)
    }

    /// Like [`try_clean_dead_entries`](Self::try_clean_dead_entries), but never evicts values
    /// for which `pinned` holds.
    pub fn try_clean_dead_entries_except(&self, pinned: impl Fn(&V) -> bool) -> Option<usize> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("identity cache sweep already running, skipping");
            return None;
        }
        let _guard = SweepGuard(&self.sweeping);

        let len = self.slots.len();
        let Some(mut excess) = len.checked_sub(self.capacity).filter(|&n| n > 0) else {
            return Some(0);
        };

        let mut dead = Vec::new();
        self.slots.iter_sync(|key, slot| {
            if Arc::strong_count(&slot.value) == 1 && !pinned(&slot.value) {
                dead.push((
                    key.clone(),
                    slot.generation,
                    slot.last_access.load(Ordering::Relaxed),
                ));
            }
            true
        });
        dead.sort_unstable_by_key(|&(_, _, last_access)| last_access);

        let mut evicted = 0;
        for (key, generation, _) in dead {
            if excess == 0 {
                break;
            }
            let removed = self.slots.remove_if_sync(&key, |slot| {
                slot.generation == generation && Arc::strong_count(&slot.value) == 1
            });
            if removed.is_some() {
                evicted += 1;
                excess -= 1;
            }
        }
        trace!(evicted, remaining = self.slots.len(), "identity cache sweep finished");
        Some(evicted)
    }
}
