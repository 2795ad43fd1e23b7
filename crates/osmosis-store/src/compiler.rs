//! Lowers an [Action] into primitive [Change]s against the current document
//! state. Compilation is deterministic: every peer that replays the same op
//! over the same state produces the same change list, which is what makes
//! the op log convergent.

use osmosis_common::{BinaryPath, Failure, FailureKind, JsonValue, PathIndex};

use crate::action::{apply_change, Action, Change, PathRef, ScalarAction};
use crate::json_source::{JsonNode, JsonSource, OverlayArena, OverlayId};
use crate::jsonpath::QueryResult;

/// Output of compiling one action: the ordered change list and any
/// recoverable failures. A transaction with failures keeps the failures and
/// drops the changes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompiledAction {
    pub changes: Vec<Change>,
    pub failures: Vec<Failure>,
}

impl CompiledAction {
    fn fail(&mut self, kind: FailureKind, path: &dyn std::fmt::Display) {
        self.failures.push(Failure::at(kind, path));
    }
}

/// Compiles an action against the state visible through `node`. Transactions
/// compile their sub-actions against a scratch overlay so later sub-actions
/// observe earlier ones; the scratch layer is discarded either way.
pub fn compile_action(
    arena: &mut OverlayArena,
    node: OverlayId,
    action: &Action<PathRef>,
) -> CompiledAction {
    match action {
        Action::Scalar(scalar) => compile_scalar(arena, node, scalar),
        Action::Transaction(actions) => {
            let scratch = arena.new_child(node);
            let mut out = CompiledAction::default();
            for scalar in actions {
                let compiled = compile_scalar(arena, scratch, scalar);
                out.failures.extend(compiled.failures);
                for change in compiled.changes {
                    // Scratch application can only fail on malformed data the
                    // compiler itself just validated.
                    if let Err(e) = apply_change(arena, scratch, &change, None) {
                        out.failures.push(Failure::new(
                            FailureKind::MalformedOp,
                            None,
                            e.to_string(),
                        ));
                    } else {
                        out.changes.push(change);
                    }
                }
            }
            arena.free(scratch);
            if !out.failures.is_empty() {
                out.changes.clear();
            }
            out
        }
    }
}

fn compile_scalar(
    arena: &OverlayArena,
    node: OverlayId,
    action: &ScalarAction<PathRef>,
) -> CompiledAction {
    let source = arena.source(node);
    let mut out = CompiledAction::default();
    match action {
        ScalarAction::Set { path, value } => {
            let q = require_targets(path, path.query(&source), true, &mut out);
            for target in q {
                if target.is_root() {
                    out.fail(FailureKind::CannotSetRoot, &target);
                    continue;
                }
                fill_array_holes(&source, &target, &mut out.changes);
                out.changes.push(Change::Put {
                    path: target,
                    value: value.clone(),
                });
            }
        }
        ScalarAction::Delete { path } => {
            let q = require_targets(path, path.query(&source), false, &mut out);
            for target in q {
                if target.is_root() {
                    out.fail(FailureKind::CannotSetRoot, &target);
                    continue;
                }
                compact_out(&source, &target, &mut out.changes);
            }
        }
        ScalarAction::Add { path, amount } => {
            compile_arithmetic(&source, path, &mut out, |n| n + amount);
        }
        ScalarAction::Multiply { path, factor } => {
            compile_arithmetic(&source, path, &mut out, |n| n * factor);
        }
        ScalarAction::InitArray { path } => {
            compile_init(&source, path, JsonValue::List(Vec::new()), &mut out);
        }
        ScalarAction::InitObject { path } => {
            compile_init(&source, path, JsonValue::Map(Default::default()), &mut out);
        }
        ScalarAction::InsertBefore { path, value } => {
            compile_insert(&source, path, value, 0, &mut out);
        }
        ScalarAction::InsertAfter { path, value } => {
            compile_insert(&source, path, value, 1, &mut out);
        }
        ScalarAction::InsertUnique { path, value } => {
            let q = require_targets(path, path.query(&source), false, &mut out);
            for target in q {
                let Some(JsonNode::Array { len }) = source.get_by_path(&target) else {
                    out.fail(FailureKind::NotAnArray, &target);
                    continue;
                };
                let mut found = None;
                for i in 0..len {
                    let child = target.append(i);
                    if source.materialize(&child).as_ref() == Some(value) {
                        found = Some(child);
                        break;
                    }
                }
                match found {
                    Some(child) => out.changes.push(Change::Touch { path: child }),
                    None => out.changes.push(Change::Put {
                        path: target.append(len),
                        value: value.clone(),
                    }),
                }
            }
        }
        ScalarAction::Move { from, to } => {
            let Some(src) = single_existing(from, &source, &mut out) else {
                return out;
            };
            let Some(dst) = single_target(to, &source, &mut out) else {
                return out;
            };
            if src.is_root() || dst.is_root() {
                out.fail(FailureKind::CannotMoveRoot, &BinaryPath::ROOT);
                return out;
            }
            out.changes.push(Change::Move {
                from: src.clone(),
                to: dst,
            });
            compact_tail_after_removal(&source, &src, &mut out.changes);
        }
        ScalarAction::Copy { from, to } => {
            let Some(src) = single_existing(from, &source, &mut out) else {
                return out;
            };
            if src.is_root() {
                out.fail(FailureKind::CannotCopyRoot, &src);
                return out;
            }
            let q = require_targets(to, to.query(&source), true, &mut out);
            let Some(value) = source.materialize(&src) else {
                out.fail(FailureKind::PathDoesNotExist, from);
                return out;
            };
            for target in q {
                if target.is_root() {
                    out.fail(FailureKind::CannotCopyRoot, &target);
                    continue;
                }
                fill_array_holes(&source, &target, &mut out.changes);
                out.changes.push(Change::Put {
                    path: target,
                    value: value.clone(),
                });
            }
        }
    }
    out
}

/// Collects the usable targets of a query, recording its failures. With
/// `include_potential` both existing and writable-next paths qualify.
/// A query that yields nothing at all becomes a `PathDoesNotExist` failure.
fn require_targets(
    path: &PathRef,
    q: QueryResult,
    include_potential: bool,
    out: &mut CompiledAction,
) -> Vec<BinaryPath> {
    out.failures.extend(q.failures.iter().cloned());
    let mut targets = q.existing;
    if include_potential {
        targets.extend(q.potential);
    }
    if targets.is_empty() && q.failures.is_empty() {
        out.fail(FailureKind::PathDoesNotExist, path);
    }
    targets
}

fn compile_arithmetic(
    source: &impl JsonSource,
    path: &PathRef,
    out: &mut CompiledAction,
    f: impl Fn(f64) -> f64,
) {
    let q = require_targets(path, path.query(source), false, out);
    for target in q {
        match source.get_by_path(&target) {
            Some(JsonNode::Scalar(JsonValue::Number(n))) => out.changes.push(Change::Put {
                path: target,
                value: JsonValue::Number(f(n)),
            }),
            Some(_) => out.fail(FailureKind::NotANumber, &target),
            None => out.fail(FailureKind::PathDoesNotExist, &target),
        }
    }
}

fn compile_init(
    source: &impl JsonSource,
    path: &PathRef,
    empty: JsonValue,
    out: &mut CompiledAction,
) {
    let wants_array = matches!(empty, JsonValue::List(_));
    let q = require_targets(path, path.query(source), true, out);
    for target in q {
        match source.get_by_path(&target) {
            Some(JsonNode::Array { .. }) if wants_array => {
                out.changes.push(Change::Touch { path: target })
            }
            Some(JsonNode::Object { .. }) if !wants_array => {
                out.changes.push(Change::Touch { path: target })
            }
            _ => {
                if target.is_root() {
                    // Re-initializing the root object is a no-op touch; the
                    // root cannot be replaced wholesale.
                    if wants_array {
                        out.fail(FailureKind::CannotSetRoot, &target);
                    } else {
                        out.changes.push(Change::Touch { path: target });
                    }
                    continue;
                }
                fill_array_holes(source, &target, &mut out.changes);
                out.changes.push(Change::Put {
                    path: target,
                    value: empty.clone(),
                });
            }
        }
    }
}

fn compile_insert(
    source: &impl JsonSource,
    path: &PathRef,
    value: &JsonValue,
    offset: u32,
    out: &mut CompiledAction,
) {
    let q = require_targets(path, path.query(source), true, out);
    for target in q {
        let Ok(Some((parent, PathIndex::Int(index)))) = target.split() else {
            out.fail(FailureKind::NotAnArray, &target);
            continue;
        };
        let Some(JsonNode::Array { len }) = source.get_by_path(&parent) else {
            out.fail(FailureKind::NotAnArray, &parent);
            continue;
        };
        let index = (index + offset).min(len);
        // Shift the tail up in descending order so no move lands on a slot
        // that has not been vacated yet.
        for j in (index..len).rev() {
            out.changes.push(Change::Move {
                from: parent.append(j),
                to: parent.append(j + 1),
            });
        }
        out.changes.push(Change::Put {
            path: parent.append(index),
            value: value.clone(),
        });
    }
}

/// Put-null padding for a write at `parent[i]` where the array is shorter
/// than `i`.
fn fill_array_holes(source: &impl JsonSource, target: &BinaryPath, changes: &mut Vec<Change>) {
    let Ok(Some((parent, PathIndex::Int(index)))) = target.split() else {
        return;
    };
    let Some(JsonNode::Array { len }) = source.get_by_path(&parent) else {
        return;
    };
    for j in len..index {
        changes.push(Change::Put {
            path: parent.append(j),
            value: JsonValue::Null,
        });
    }
}

/// Removal of one location. Array elements shift the tail down over the
/// vacated slot and delete the last index; everything else deletes in place.
fn compact_out(source: &impl JsonSource, target: &BinaryPath, changes: &mut Vec<Change>) {
    match array_position(source, target) {
        Some((parent, index, len)) if index + 1 < len => {
            for j in index + 1..len {
                changes.push(Change::Move {
                    from: parent.append(j),
                    to: parent.append(j - 1),
                });
            }
            changes.push(Change::Delete {
                path: parent.append(len - 1),
            });
        }
        _ => changes.push(Change::Delete {
            path: target.clone(),
        }),
    }
}

/// Source-side cleanup after a subtree was moved away: shift any later
/// siblings down and delete the stale tail slot.
fn compact_tail_after_removal(
    source: &impl JsonSource,
    removed: &BinaryPath,
    changes: &mut Vec<Change>,
) {
    if let Some((parent, index, len)) = array_position(source, removed) {
        if index + 1 < len {
            for j in index + 1..len {
                changes.push(Change::Move {
                    from: parent.append(j),
                    to: parent.append(j - 1),
                });
            }
            changes.push(Change::Delete {
                path: parent.append(len - 1),
            });
        }
    }
}

fn array_position(
    source: &impl JsonSource,
    target: &BinaryPath,
) -> Option<(BinaryPath, u32, u32)> {
    let (parent, PathIndex::Int(index)) = target.split().ok()?? else {
        return None;
    };
    match source.get_by_path(&parent) {
        Some(JsonNode::Array { len }) => Some((parent, index, len)),
        _ => None,
    }
}

fn single_existing(
    path: &PathRef,
    source: &impl JsonSource,
    out: &mut CompiledAction,
) -> Option<BinaryPath> {
    let q = path.query(source);
    out.failures.extend(q.failures.iter().cloned());
    match q.existing.len() {
        0 => {
            if q.failures.is_empty() {
                out.fail(FailureKind::PathDoesNotExist, path);
            }
            None
        }
        1 => q.existing.into_iter().next(),
        _ => {
            out.fail(FailureKind::MoreThanOnePath, path);
            None
        }
    }
}

/// Exactly one destination, existing or writable.
fn single_target(
    path: &PathRef,
    source: &impl JsonSource,
    out: &mut CompiledAction,
) -> Option<BinaryPath> {
    let q = path.query(source);
    out.failures.extend(q.failures.iter().cloned());
    let mut targets = q.existing;
    targets.extend(q.potential);
    match targets.len() {
        0 => {
            if q.failures.is_empty() {
                out.fail(FailureKind::PathDoesNotExist, path);
            }
            None
        }
        1 => targets.into_iter().next(),
        _ => {
            out.fail(FailureKind::MoreThanOnePath, path);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonpath::parse;
    use osmosis_common::BinaryPath;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup(value: serde_json::Value) -> (OverlayArena, OverlayId) {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(base, &BinaryPath::ROOT, &value.into(), None)
            .unwrap();
        (arena, base)
    }

    fn scalar(action: ScalarAction<&str>) -> Action<PathRef> {
        Action::Scalar(action.map_paths(|p| PathRef::Compiled(parse(p).unwrap())))
    }

    fn p(key: &str) -> BinaryPath {
        BinaryPath::ROOT.append(key)
    }

    #[test]
    fn set_simple() {
        let (mut arena, base) = setup(json!({}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Set {
                path: "$.foo",
                value: "bar".into(),
            }),
        );
        assert!(out.failures.is_empty());
        assert_eq!(
            out.changes,
            vec![Change::Put {
                path: p("foo"),
                value: "bar".into(),
            }]
        );
    }

    #[test]
    fn set_fills_array_holes() {
        let (mut arena, base) = setup(json!({"a": [0]}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Set {
                path: "$.a[3]",
                value: "x".into(),
            }),
        );
        assert_eq!(
            out.changes,
            vec![
                Change::Put { path: p("a").append(1u32), value: JsonValue::Null },
                Change::Put { path: p("a").append(2u32), value: JsonValue::Null },
                Change::Put { path: p("a").append(3u32), value: "x".into() },
            ]
        );
    }

    #[test]
    fn delete_compacts_arrays() {
        let (mut arena, base) = setup(json!({"a": [10, 20, 30]}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Delete { path: "$.a[0]" }),
        );
        assert_eq!(
            out.changes,
            vec![
                Change::Move { from: p("a").append(1u32), to: p("a").append(0u32) },
                Change::Move { from: p("a").append(2u32), to: p("a").append(1u32) },
                Change::Delete { path: p("a").append(2u32) },
            ]
        );
    }

    #[test]
    fn delete_root_rejected() {
        let (mut arena, base) = setup(json!({"a": 1}));
        let out = compile_action(&mut arena, base, &scalar(ScalarAction::Delete { path: "$" }));
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].kind, FailureKind::CannotSetRoot);
        assert!(out.changes.is_empty());
    }

    #[test]
    fn insert_before_shifts_descending() {
        let (mut arena, base) = setup(json!({"foo": ["b", "c"]}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::InsertBefore {
                path: "$.foo[0]",
                value: "a".into(),
            }),
        );
        assert_eq!(
            out.changes,
            vec![
                Change::Move { from: p("foo").append(1u32), to: p("foo").append(2u32) },
                Change::Move { from: p("foo").append(0u32), to: p("foo").append(1u32) },
                Change::Put { path: p("foo").append(0u32), value: "a".into() },
            ]
        );
    }

    #[test]
    fn insert_after_clamps() {
        let (mut arena, base) = setup(json!({"a": [1]}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::InsertAfter {
                path: "$.a[0]",
                value: 9.into(),
            }),
        );
        assert_eq!(
            out.changes,
            vec![Change::Put { path: p("a").append(1u32), value: 9.into() }]
        );
    }

    #[test]
    fn insert_unique_touches_duplicates() {
        let (mut arena, base) = setup(json!({"tags": ["x", "y"]}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::InsertUnique {
                path: "$.tags",
                value: "y".into(),
            }),
        );
        assert_eq!(
            out.changes,
            vec![Change::Touch { path: p("tags").append(1u32) }]
        );
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::InsertUnique {
                path: "$.tags",
                value: "z".into(),
            }),
        );
        assert_eq!(
            out.changes,
            vec![Change::Put { path: p("tags").append(2u32), value: "z".into() }]
        );
    }

    #[test]
    fn add_requires_number() {
        let (mut arena, base) = setup(json!({"n": 4, "s": "x"}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Add { path: "$.n", amount: 2.5 }),
        );
        assert_eq!(
            out.changes,
            vec![Change::Put { path: p("n"), value: 6.5.into() }]
        );
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Add { path: "$.s", amount: 1.0 }),
        );
        assert_eq!(out.failures[0].kind, FailureKind::NotANumber);
        assert!(out.changes.is_empty());
    }

    #[test]
    fn init_touches_matching_type() {
        let (mut arena, base) = setup(json!({"a": [1], "o": {"k": 1}}));
        let out = compile_action(&mut arena, base, &scalar(ScalarAction::InitArray { path: "$.a" }));
        assert_eq!(out.changes, vec![Change::Touch { path: p("a") }]);
        let out =
            compile_action(&mut arena, base, &scalar(ScalarAction::InitObject { path: "$.o" }));
        assert_eq!(out.changes, vec![Change::Touch { path: p("o") }]);
        let out =
            compile_action(&mut arena, base, &scalar(ScalarAction::InitArray { path: "$.new" }));
        assert_eq!(
            out.changes,
            vec![Change::Put { path: p("new"), value: JsonValue::List(vec![]) }]
        );
    }

    #[test]
    fn move_compacts_source() {
        let (mut arena, base) = setup(json!({"a": [1, 2, 3], "b": {}}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Move { from: "$.a[0]", to: "$.b.moved" }),
        );
        assert_eq!(
            out.changes,
            vec![
                Change::Move { from: p("a").append(0u32), to: p("b").append("moved") },
                Change::Move { from: p("a").append(1u32), to: p("a").append(0u32) },
                Change::Move { from: p("a").append(2u32), to: p("a").append(1u32) },
                Change::Delete { path: p("a").append(2u32) },
            ]
        );
    }

    #[test]
    fn move_rejects_multiple_paths() {
        let (mut arena, base) = setup(json!({"a": {"x": 1, "y": 2}, "b": {}}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Move { from: "$.a.*", to: "$.b.z" }),
        );
        assert_eq!(out.failures[0].kind, FailureKind::MoreThanOnePath);
        assert!(out.changes.is_empty());
    }

    #[test]
    fn copy_serializes_subtree() {
        let (mut arena, base) = setup(json!({"src": {"deep": [1, 2]}, "dst": {}}));
        let out = compile_action(
            &mut arena,
            base,
            &scalar(ScalarAction::Copy { from: "$.src", to: "$.dst.twin" }),
        );
        assert_eq!(
            out.changes,
            vec![Change::Put {
                path: p("dst").append("twin"),
                value: json!({"deep": [1, 2]}).into(),
            }]
        );
    }

    #[test]
    fn transaction_discards_on_any_failure() {
        let (mut arena, base) = setup(json!({"n": 1}));
        let action = Action::Transaction(vec![
            ScalarAction::Set { path: "$.x", value: 1.into() }
                .map_paths(|p| PathRef::Compiled(parse(p).unwrap())),
            ScalarAction::Add { path: "$.missing", amount: 1.0 }
                .map_paths(|p| PathRef::Compiled(parse(p).unwrap())),
        ]);
        let out = compile_action(&mut arena, base, &action);
        assert!(out.changes.is_empty());
        assert!(!out.failures.is_empty());
        // The scratch overlay never leaked into the live state.
        assert!(arena.get_by_path(base, &p("x")).is_none());
    }

    #[test]
    fn transaction_sub_actions_see_earlier_writes() {
        let (mut arena, base) = setup(json!({}));
        let action = Action::Transaction(vec![
            ScalarAction::Set { path: "$.counter", value: 1.into() }
                .map_paths(|p| PathRef::Compiled(parse(p).unwrap())),
            ScalarAction::Add { path: "$.counter", amount: 2.0 }
                .map_paths(|p| PathRef::Compiled(parse(p).unwrap())),
        ]);
        let out = compile_action(&mut arena, base, &action);
        assert!(out.failures.is_empty());
        assert_eq!(
            out.changes,
            vec![
                Change::Put { path: p("counter"), value: 1.into() },
                Change::Put { path: p("counter"), value: 3.into() },
            ]
        );
    }
}
