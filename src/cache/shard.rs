//! CLOCK Shard
//!
//! One lock domain of a [`ClockTable`](super::table::ClockTable). A shard owns
//! a circular vector of slots, an index from key to slot, and its own clock
//! hand.
//!
//! # Design
//!
//! - Slots are reused through a free list, so the clock ring never shrinks
//! - The recently-used bit is atomic so hits only need the shard read lock
//! - Pin counts live in the shared entry and are read under the write lock
//!   before anything is evicted

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared allocation behind a resident value and every handle to it
pub(crate) struct Entry<V> {
    pub(crate) value: V,
    pub(crate) pins: AtomicUsize,
}

impl<V> Entry<V> {
    /// New entry already pinned once by its inserter
    pub(crate) fn pinned(value: V) -> Arc<Self> {
        Arc::new(Self {
            value,
            pins: AtomicUsize::new(1),
        })
    }

    #[inline]
    pub(crate) fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// Eviction bookkeeping for one resident value
pub(crate) struct Slot<K, V> {
    pub(crate) key: K,
    pub(crate) entry: Arc<Entry<V>>,
    pub(crate) referenced: AtomicBool,
    pub(crate) weight: u64,
}

/// Result of one sweep over a shard
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepOutcome {
    /// Bytes released
    pub reclaimed: u64,
    /// Slots freed
    pub evicted: usize,
    /// Pinned slots skipped
    pub pinned: usize,
}

/// Single shard containing the clock ring for a subset of keys
pub(crate) struct ClockShard<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    hand: usize,
    bytes: u64,
}

impl<K, V> Default for ClockShard<K, V> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            hand: 0,
            bytes: 0,
        }
    }
}

impl<K: Eq + Hash + Clone, V> ClockShard<K, V> {
    /// Number of resident values
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Resident bytes in this shard
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Slot holding `key`, if resident
    pub fn lookup(&self, key: &K) -> Option<&Slot<K, V>> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref()
    }

    /// Install a value that is known to be absent. The new slot starts with
    /// its recently-used bit clear: only later hits earn a second chance.
    pub fn install(&mut self, key: K, entry: Arc<Entry<V>>, weight: u64) {
        debug_assert!(!self.index.contains_key(&key));
        let slot = Slot {
            key: key.clone(),
            entry,
            referenced: AtomicBool::new(false),
            weight,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.bytes += weight;
    }

    /// Remove `key` unless a handle still pins it. Returns the freed weight.
    pub fn remove_unpinned(&mut self, key: &K) -> Option<u64> {
        let idx = *self.index.get(key)?;
        let pinned = self.slots[idx]
            .as_ref()
            .map(|slot| slot.entry.is_pinned())
            .unwrap_or(false);
        if pinned {
            return None;
        }
        Some(self.vacate(idx))
    }

    /// Remove every unpinned value whose key matches `pred`.
    /// Returns (evicted count, freed bytes).
    pub fn remove_matching<F>(&mut self, pred: F) -> (usize, u64)
    where
        F: Fn(&K) -> bool,
    {
        let victims: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(slot) if pred(&slot.key) && !slot.entry.is_pinned() => Some(idx),
                _ => None,
            })
            .collect();

        let mut freed = 0;
        for idx in &victims {
            freed += self.vacate(*idx);
        }
        (victims.len(), freed)
    }

    /// Advance the clock hand for at most one revolution, evicting until
    /// `target` bytes have been reclaimed.
    ///
    /// Referenced slots lose their bit and survive; pinned slots are skipped
    /// with their bit untouched.
    pub fn sweep(&mut self, target: u64) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let ring = self.slots.len();
        if ring == 0 {
            return outcome;
        }

        for _ in 0..ring {
            if outcome.reclaimed >= target {
                break;
            }
            let idx = self.hand;
            self.hand = (self.hand + 1) % ring;

            let evict = match &self.slots[idx] {
                None => false,
                Some(slot) if slot.entry.is_pinned() => {
                    outcome.pinned += 1;
                    false
                }
                Some(slot) => !slot.referenced.swap(false, Ordering::Relaxed),
            };

            if evict {
                outcome.reclaimed += self.vacate(idx);
                outcome.evicted += 1;
            }
        }

        outcome
    }

    /// Drop everything that is not pinned. Returns freed bytes.
    pub fn clear_unpinned(&mut self) -> u64 {
        self.remove_matching(|_| true).1
    }

    fn vacate(&mut self, idx: usize) -> u64 {
        match self.slots[idx].take() {
            Some(slot) => {
                self.index.remove(&slot.key);
                self.free.push(idx);
                self.bytes -= slot.weight;
                slot.weight
            }
            None => 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
