//! Property-Based Tests for Secondary Indices
//!
//! # Test Properties
//!
//! 1. **Sorted Order**: sorter values are always in ascending key order
//! 2. **Last Write Wins**: every id appears once, with its latest object
//! 3. **Index Consistency**: every object is found under exactly the key its
//!    latest version produces
//! 4. **Descending Keys**: `DescendingLong` reverses the natural order

#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use super::{DescendingLong, Indexer, Sorter, TieBreaker};
use crate::domain::ports::testing::Bam;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(i64, String),
    Remove(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0i64..20, "[a-e]{1,2}").prop_map(|(id, name)| Op::Put(id, name)),
        1 => (0i64..20).prop_map(Op::Remove),
    ]
}

/// Reference model: id -> name after applying the ops in order.
fn model(ops: &[Op]) -> BTreeMap<i64, String> {
    let mut expected = BTreeMap::new();
    for op in ops {
        match op {
            Op::Put(id, name) => {
                expected.insert(*id, name.clone());
            }
            Op::Remove(id) => {
                expected.remove(id);
            }
        }
    }
    expected
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_sorter_matches_model(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let sorter = Sorter::by("by-name", |b: &Bam| b.name.clone());
        for op in &ops {
            match op {
                Op::Put(id, name) => sorter.put(Arc::new(Bam::new(*id, name))),
                Op::Remove(id) => {
                    sorter.remove(id);
                }
            }
        }

        let expected = model(&ops);
        let mut expected_order: Vec<(String, i64)> =
            expected.iter().map(|(id, name)| (name.clone(), *id)).collect();
        expected_order.sort();

        let actual: Vec<(String, i64)> =
            sorter.values().iter().map(|b| (b.name.clone(), b.id)).collect();
        prop_assert_eq!(actual, expected_order);
        prop_assert_eq!(sorter.len(), expected.len());
    }

    #[test]
    fn prop_indexer_matches_model(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let index = Indexer::new("by-name", |b: &Bam| Some(b.name.clone()));
        for op in &ops {
            match op {
                Op::Put(id, name) => index.put(Arc::new(Bam::new(*id, name))),
                Op::Remove(id) => {
                    index.remove(id);
                }
            }
        }

        let expected = model(&ops);
        prop_assert_eq!(index.len(), expected.len());
        for (id, name) in &expected {
            let found: Vec<i64> = index.get(name).iter().map(|b| b.id).collect();
            prop_assert!(found.contains(id));
            prop_assert_eq!(index.key_of(id), Some(name.clone()));
        }
        let total: usize = index.keys().iter().map(|k| index.get(k).len()).sum();
        prop_assert_eq!(total, expected.len());
    }

    #[test]
    fn prop_descending_long_reverses_order(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(a != b);
        let ties = TieBreaker::new();
        let ka = DescendingLong::new(a, &ties);
        let kb = DescendingLong::new(b, &ties);
        prop_assert_eq!(ka.cmp(&kb), b.cmp(&a));
    }
}
