//! Property-Based Tests for the CLOCK Table
//!
//! # Test Properties
//!
//! 1. **Capacity Bound**: with no outstanding handles, every insertion
//!    leaves resident bytes within the budget
//! 2. **Accounting**: the shared byte counter always equals the sum of the
//!    weights of resident values
//! 3. **Pinning Safety**: a value with a live handle is never evicted
//! 4. **Coherence**: a hit always returns the value that was inserted

#![cfg(test)]

use std::collections::HashMap;

use proptest::prelude::*;

use super::key::ShardKey;
use super::table::{ClockTable, Weighted};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key(u16);

impl ShardKey for Key {
    fn shard_index(&self, shard_count: usize) -> usize {
        (self.0 as usize).wrapping_mul(31) & (shard_count - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Value {
    key: u16,
    weight: u64,
}

impl Weighted for Value {
    fn weight(&self) -> u64 {
        self.weight
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u64),
    Get(u16),
    Invalidate(u16),
}

// =============================================================================
// Property Strategies
// =============================================================================

const CAPACITY: u64 = 256;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u16..64, 1u64..=64).prop_map(|(k, w)| Op::Insert(k, w)),
        3 => (0u16..64).prop_map(Op::Get),
        1 => (0u16..64).prop_map(Op::Invalidate),
    ]
}

fn shard_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1usize), Just(2), Just(4), Just(8)]
}

/// Sum of weights of every resident key, with a coherence check on each
fn resident_weight(table: &ClockTable<Key, Value>, weights: &HashMap<u16, u64>) -> u64 {
    let mut total = 0;
    for (&k, &w) in weights {
        if let Some(v) = table.peek(&Key(k)) {
            assert_eq!(v.key, k);
            assert_eq!(v.weight, w);
            total += w;
        }
    }
    total
}

// =============================================================================
// Capacity And Accounting
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_capacity_bound_without_pins(
        shards in shard_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..300),
    ) {
        let table = ClockTable::new(CAPACITY, shards);
        // Weight of the value each key was first inserted with
        let mut weights: HashMap<u16, u64> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(k, w) => {
                    let w = if table.contains(&Key(k)) { weights[&k] } else { w };
                    drop(table.insert(Key(k), Value { key: k, weight: w }));
                    weights.insert(k, w);
                    prop_assert!(table.resident_bytes() <= CAPACITY);
                }
                Op::Get(k) => {
                    if let Some(v) = table.get(&Key(k)) {
                        prop_assert_eq!(v.key, k);
                    }
                }
                Op::Invalidate(k) => {
                    table.invalidate(&Key(k));
                }
            }
            prop_assert_eq!(table.resident_bytes(), table.shard_bytes());
            prop_assert_eq!(table.resident_bytes(), resident_weight(&table, &weights));
        }
        prop_assert_eq!(table.stats().overflows, 0);
    }

    #[test]
    fn prop_pinned_values_survive(
        shards in shard_strategy(),
        pinned_keys in prop::collection::hash_set(100u16..110, 1..4),
        ops in prop::collection::vec(op_strategy(), 1..300),
    ) {
        let table = ClockTable::new(CAPACITY, shards);
        let held: Vec<_> = pinned_keys
            .iter()
            .map(|&k| table.insert(Key(k), Value { key: k, weight: 16 }))
            .collect();

        for op in ops {
            match op {
                Op::Insert(k, w) => drop(table.insert(Key(k), Value { key: k, weight: w })),
                Op::Get(k) => drop(table.get(&Key(k))),
                Op::Invalidate(k) => {
                    table.invalidate(&Key(k));
                }
            }
            for &k in &pinned_keys {
                prop_assert!(table.contains(&Key(k)));
            }
        }

        for handle in &held {
            prop_assert_eq!(handle.weight, 16);
            prop_assert!(pinned_keys.contains(&handle.key));
        }
        // At most 3 x 16 pinned bytes plus one in-flight insertion
        prop_assert!(table.resident_bytes() <= CAPACITY.max(48 + 64));
    }

    #[test]
    fn prop_invalidate_matching_keeps_accounting(
        shards in shard_strategy(),
        keys in prop::collection::vec((0u16..64, 1u64..=16), 1..40),
        modulus in 2u16..5,
    ) {
        let table = ClockTable::new(u64::MAX, shards);
        let mut weights: HashMap<u16, u64> = HashMap::new();
        for (k, w) in keys {
            let w = *weights.entry(k).or_insert(w);
            drop(table.insert(Key(k), Value { key: k, weight: w }));
        }

        table.invalidate_matching(|key| key.0 % modulus == 0);
        for &k in weights.keys() {
            prop_assert_eq!(table.contains(&Key(k)), k % modulus != 0);
        }
        prop_assert_eq!(table.resident_bytes(), resident_weight(&table, &weights));
        prop_assert_eq!(table.resident_bytes(), table.shard_bytes());
    }
}
