//! Permutation properties: any delivery order and any batch split of the
//! same op set must produce the same document, the same op log, and the
//! same state hash.

use osmosis_common::BinaryPath;
use osmosis_store::{
    parse_jsonpath, Action, Id, JsonSource, Op, PathRef, SaveStateCore, ScalarAction,
};
use proptest::prelude::*;
use uuid::Uuid;

fn author(byte: u8) -> Uuid {
    Uuid::from_bytes([byte; 16])
}

fn compiled(path: &str) -> PathRef {
    PathRef::Compiled(parse_jsonpath(path).unwrap())
}

/// One op per spec entry, with per-author indices assigned sequentially so
/// ids are unique. A mix of actions that exercises hole filling, array
/// compaction and failure recording, all of which must stay deterministic.
fn build_ops(spec: Vec<(u8, u8, i32)>) -> Vec<Op> {
    let mut counters = [0u64; 4];
    spec.into_iter()
        .map(|(author_byte, kind, value)| {
            counters[author_byte as usize] += 1;
            let id = Id::new(author(author_byte), counters[author_byte as usize]);
            let action = match kind % 6 {
                0 => ScalarAction::Set {
                    path: compiled("$.a"),
                    value: value.into(),
                },
                1 => ScalarAction::Set {
                    path: compiled("$.b"),
                    value: value.into(),
                },
                2 => ScalarAction::InitArray {
                    path: compiled("$.list"),
                },
                3 => ScalarAction::InsertBefore {
                    path: compiled("$.list[0]"),
                    value: value.into(),
                },
                4 => ScalarAction::Delete {
                    path: compiled("$.a"),
                },
                _ => ScalarAction::Add {
                    path: compiled("$.b"),
                    amount: value as f64,
                },
            };
            Op {
                id,
                action: Action::Scalar(action),
            }
        })
        .collect()
}

fn document(core: &SaveStateCore) -> serde_json::Value {
    core.source()
        .materialize(&BinaryPath::ROOT)
        .unwrap()
        .into()
}

fn log_ids(core: &SaveStateCore) -> Vec<Id> {
    core.ops_range(None, None).iter().map(|op| op.id).collect()
}

proptest! {
    #[test]
    fn permuted_chunked_inserts_converge(
        (ops, order, splits) in prop::collection::vec((1u8..=3, 0u8..6, -5i32..5), 1..14)
            .prop_map(build_ops)
            .prop_flat_map(|ops| {
                let n = ops.len();
                (
                    Just(ops),
                    Just((0..n).collect::<Vec<usize>>()).prop_shuffle(),
                    prop::collection::vec(any::<bool>(), n),
                )
            })
    ) {
        let mut reference = SaveStateCore::new();
        reference.insert(ops.clone()).unwrap();

        let mut permuted = SaveStateCore::new();
        let mut batch = Vec::new();
        for (i, index) in order.iter().enumerate() {
            batch.push(ops[*index].clone());
            if splits[i] {
                permuted.insert(std::mem::take(&mut batch)).unwrap();
            }
        }
        if !batch.is_empty() {
            permuted.insert(batch).unwrap();
        }

        prop_assert_eq!(
            reference.state_summary().hash,
            permuted.state_summary().hash
        );
        prop_assert_eq!(document(&reference), document(&permuted));
        prop_assert_eq!(log_ids(&reference), log_ids(&permuted));

        // The log is strictly sorted with no duplicates.
        let ids = log_ids(&permuted);
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(ids.len(), ops.len());
    }

    #[test]
    fn two_peers_with_different_interleavings_converge(
        (ops, order) in prop::collection::vec((1u8..=2, 0u8..6, -5i32..5), 1..10)
            .prop_map(build_ops)
            .prop_flat_map(|ops| {
                let n = ops.len();
                (Just(ops), Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
            })
    ) {
        // Peer one sees the ops one at a time in canonical order; peer two
        // sees the shuffled order, also one at a time.
        let mut one = SaveStateCore::new();
        for op in &ops {
            one.insert(vec![op.clone()]).unwrap();
        }
        let mut two = SaveStateCore::new();
        for index in &order {
            two.insert(vec![ops[*index].clone()]).unwrap();
        }
        prop_assert_eq!(one.state_summary(), two.state_summary());
        prop_assert_eq!(document(&one), document(&two));
    }
}
