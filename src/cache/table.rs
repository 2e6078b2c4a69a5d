//! Sharded CLOCK Table
//!
//! Byte-bounded associative cache with second-chance eviction, used for
//! both pack blocks and parsed indexes.
//!
//! # Design
//!
//! - Each shard has its own RwLock; hits take the read lock only
//! - Resident bytes are one shared counter, adjusted while holding the lock
//!   of the shard being filled or swept
//! - A sweep walks shards round-robin, two revolutions at most: the first
//!   clears recently-used bits, the second evicts what was not touched since
//! - Pinned values are never evicted. When everything left is pinned the
//!   table stays above capacity and counts an overflow

use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::key::ShardKey;
use super::shard::{ClockShard, Entry};

/// Values that know how many bytes they charge against the table budget
pub trait Weighted {
    /// Bytes charged while resident
    fn weight(&self) -> u64;
}

/// Counted borrow of a resident value. The value cannot be evicted while
/// any `Pinned` for it is alive; dropping the last one makes it evictable.
pub struct Pinned<V> {
    entry: Arc<Entry<V>>,
}

impl<V> Pinned<V> {
    /// Wrap an entry whose pin count was already incremented for us
    fn adopt(entry: Arc<Entry<V>>) -> Self {
        Self { entry }
    }

    /// Take a new pin on an entry
    fn acquire(entry: &Arc<Entry<V>>) -> Self {
        entry.pins.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: Arc::clone(entry),
        }
    }

    /// Number of live pins, this one included
    pub fn pin_count(&self) -> usize {
        self.entry.pins.load(Ordering::Acquire)
    }
}

impl<V> Clone for Pinned<V> {
    fn clone(&self) -> Self {
        Self::acquire(&self.entry)
    }
}

impl<V> Drop for Pinned<V> {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<V> Deref for Pinned<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.entry.value
    }
}

impl<V: Debug> Debug for Pinned<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinned")
            .field("value", &self.entry.value)
            .field("pins", &self.pin_count())
            .finish()
    }
}

/// Table statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableStats {
    /// Byte budget
    pub capacity: u64,
    /// Current resident bytes
    pub resident_bytes: u64,
    /// Number of resident values
    pub entries: usize,
    /// Lookups that found a value
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Values evicted by sweeps
    pub evictions: u64,
    /// Sweeps that could not get back under capacity
    pub overflows: u64,
    /// Resident bytes over capacity (may exceed 1.0 while pinned)
    pub fill_ratio: f64,
}

/// Sharded byte-bounded CLOCK table
pub struct ClockTable<K, V> {
    shards: Box<[CachePadded<RwLock<ClockShard<K, V>>>]>,
    capacity: u64,
    resident: AtomicU64,
    sweep_cursor: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    overflows: AtomicU64,
}

impl<K, V> ClockTable<K, V>
where
    K: Eq + Hash + Clone + Debug + ShardKey,
    V: Weighted,
{
    /// Create a table with a byte budget of `capacity` split over
    /// `shard_count` locks (power of two)
    pub fn new(capacity: u64, shard_count: usize) -> Self {
        assert!(shard_count.is_power_of_two(), "shard count must be a power of two");
        let shards = (0..shard_count)
            .map(|_| CachePadded::new(RwLock::new(ClockShard::default())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            capacity,
            resident: AtomicU64::new(0),
            sweep_cursor: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, key: &K) -> &RwLock<ClockShard<K, V>> {
        &self.shards[key.shard_index(self.shards.len())]
    }

    /// Look up `key`, pinning the value and setting its recently-used bit
    pub fn get(&self, key: &K) -> Option<Pinned<V>> {
        let shard = self.shard_for(key).read();
        match shard.lookup(key) {
            Some(slot) => {
                slot.referenced.store(true, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(?key, "table hit");
                Some(Pinned::acquire(&slot.entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(?key, "table miss");
                None
            }
        }
    }

    /// Pin `key` if resident without touching hit/miss counters or the
    /// recently-used bit
    pub fn peek(&self, key: &K) -> Option<Pinned<V>> {
        self.shard_for(key)
            .read()
            .lookup(key)
            .map(|slot| Pinned::acquire(&slot.entry))
    }

    /// Whether `key` is resident. Does not count as a use.
    pub fn contains(&self, key: &K) -> bool {
        self.shard_for(key).read().lookup(key).is_some()
    }

    /// Install `value` under `key` and return it pinned for the caller.
    ///
    /// If another caller installed the key first, the resident value wins
    /// and `value` is dropped. A sweep runs afterwards if the table is over
    /// budget; the returned value is pinned so the sweep cannot take it.
    pub fn insert(&self, key: K, value: V) -> Pinned<V> {
        let pinned = {
            let mut shard = self.shard_for(&key).write();
            if let Some(slot) = shard.lookup(&key) {
                return Pinned::acquire(&slot.entry);
            }
            let weight = value.weight();
            let entry = Entry::pinned(value);
            shard.install(key, Arc::clone(&entry), weight);
            self.resident.fetch_add(weight, Ordering::AcqRel);
            Pinned::adopt(entry)
        };

        self.evict_if_needed();
        pinned
    }

    /// Remove `key` unless it is pinned. Returns whether it was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut shard = self.shard_for(key).write();
        match shard.remove_unpinned(key) {
            Some(weight) => {
                self.resident.fetch_sub(weight, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Remove every unpinned value whose key matches `pred`. Returns the
    /// number of values removed.
    pub fn invalidate_matching<F>(&self, pred: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let (count, freed) = shard.remove_matching(&pred);
            self.resident.fetch_sub(freed, Ordering::AcqRel);
            removed += count;
        }
        removed
    }

    /// Drop every unpinned value
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let freed = shard.clear_unpinned();
            self.resident.fetch_sub(freed, Ordering::AcqRel);
        }
    }

    /// Run the CLOCK sweep until resident bytes fit the budget or every
    /// shard has been visited twice.
    fn evict_if_needed(&self) {
        if self.resident.load(Ordering::Acquire) <= self.capacity {
            return;
        }

        let count = self.shards.len();
        let start = self.sweep_cursor.load(Ordering::Relaxed);
        let mut pinned_seen = 0;

        for step in 0..count * 2 {
            let idx = (start + step) % count;
            let mut shard = self.shards[idx].write();

            let excess = self
                .resident
                .load(Ordering::Acquire)
                .saturating_sub(self.capacity);
            if excess == 0 {
                self.sweep_cursor.store(idx, Ordering::Relaxed);
                return;
            }

            let outcome = shard.sweep(excess);
            pinned_seen += outcome.pinned;
            if outcome.evicted > 0 {
                self.resident.fetch_sub(outcome.reclaimed, Ordering::AcqRel);
                self.evictions
                    .fetch_add(outcome.evicted as u64, Ordering::Relaxed);
                debug!(
                    shard = idx,
                    evicted = outcome.evicted,
                    reclaimed = outcome.reclaimed,
                    "clock sweep evicted"
                );
            }
        }

        let resident = self.resident.load(Ordering::Acquire);
        if resident > self.capacity {
            self.sweep_cursor.store(start, Ordering::Relaxed);
            self.overflows.fetch_add(1, Ordering::Relaxed);
            warn!(
                resident,
                capacity = self.capacity,
                pinned = pinned_seen,
                "capacity exceeded transiently: remaining entries are pinned"
            );
        }
    }

    /// Current resident bytes
    pub fn resident_bytes(&self) -> u64 {
        self.resident.load(Ordering::Acquire)
    }

    /// Byte budget
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of resident values
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether nothing is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lock shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Sum of per-shard byte counts; equals `resident_bytes` when quiescent
    pub fn shard_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.read().bytes()).sum()
    }

    /// Get table statistics
    pub fn stats(&self) -> TableStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let resident_bytes = self.resident_bytes();
        TableStats {
            capacity: self.capacity,
            resident_bytes,
            entries: self.len(),
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            fill_ratio: if self.capacity == 0 {
                0.0
            } else {
                resident_bytes as f64 / self.capacity as f64
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
