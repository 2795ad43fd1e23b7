use fxhash::FxHashSet;
use osmosis_common::{BinaryPath, Failure, FailureKind, JsonValue};

use super::expr::{as_index, PathExpr};
use super::{CompiledJsonPath, Segment};
use crate::json_source::{JsonNode, JsonSource};

/// Outcome of evaluating a compiled path. The three sets are disjoint:
/// `existing` resolve to a value now, `potential` could be written to (the
/// next array index, a fresh object key — only collected for the final
/// segment), `failures` name locations ruled out by a type mismatch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueryResult {
    pub existing: Vec<BinaryPath>,
    pub potential: Vec<BinaryPath>,
    pub failures: Vec<Failure>,
}

pub fn query_paths(source: &impl JsonSource, compiled: &CompiledJsonPath) -> QueryResult {
    query_paths_from(source, BinaryPath::ROOT, &compiled.0)
}

/// Evaluates `segments` starting from a concrete base path (used directly by
/// id-anchored paths).
pub fn query_paths_from(
    source: &impl JsonSource,
    base: BinaryPath,
    segments: &[Segment],
) -> QueryResult {
    let mut result = QueryResult::default();
    if source.get_by_path(&base).is_none() {
        return result;
    }
    let existing = eval_segments(source, vec![base], segments, true, &mut result);
    result.existing = dedup(existing);
    result.potential = dedup(std::mem::take(&mut result.potential));
    let known: FxHashSet<&BinaryPath> = result.existing.iter().collect();
    result.potential.retain(|p| !known.contains(p));
    result
}

fn dedup(paths: Vec<BinaryPath>) -> Vec<BinaryPath> {
    let mut seen = FxHashSet::default();
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

/// Walks the segment list stage by stage. Paths in the working set always
/// exist; potentials are emitted only from the final stage (and only when
/// `allow_potential` — recursion into `Recursive` keeps the caller's flag).
fn eval_segments(
    source: &impl JsonSource,
    starts: Vec<BinaryPath>,
    segments: &[Segment],
    allow_potential: bool,
    result: &mut QueryResult,
) -> Vec<BinaryPath> {
    let mut states = starts;
    for (stage, segment) in segments.iter().enumerate() {
        let last = stage + 1 == segments.len();
        let mut next = Vec::new();
        for path in &states {
            let Some(node) = source.get_by_path(path) else {
                continue;
            };
            apply_segment(
                source,
                path,
                &node,
                segment,
                last && allow_potential,
                &mut next,
                result,
            );
        }
        states = next;
    }
    states
}

#[allow(clippy::too_many_arguments)]
fn apply_segment(
    source: &impl JsonSource,
    path: &BinaryPath,
    node: &JsonNode,
    segment: &Segment,
    potential_ok: bool,
    next: &mut Vec<BinaryPath>,
    result: &mut QueryResult,
) {
    match segment {
        Segment::Wildcard => match node {
            JsonNode::Array { len } => next.extend((0..*len).map(|i| path.append(i))),
            JsonNode::Object { keys } => {
                next.extend(keys.iter().map(|k| path.append(k.as_str())))
            }
            JsonNode::Scalar(_) => {}
        },
        Segment::Key(key) => apply_key(path, node, key, potential_ok, next, result),
        Segment::MultiKey(keys) => {
            for key in keys {
                apply_key(path, node, key, potential_ok, next, result);
            }
        }
        Segment::Index(index) => apply_index(path, node, *index, potential_ok, next, result),
        Segment::MultiIndex(indices) => {
            for index in indices {
                apply_index(path, node, *index, potential_ok, next, result);
            }
        }
        Segment::ExprIndex(exprs) => {
            let current = source.materialize(path).unwrap_or_default();
            for expr in exprs {
                match expr.eval(&current) {
                    Ok(JsonValue::Number(n)) => match node {
                        JsonNode::Array { len } => {
                            match as_index(n, *len as usize) {
                                Ok(i) => apply_index(
                                    path,
                                    node,
                                    i as i64,
                                    potential_ok,
                                    next,
                                    result,
                                ),
                                Err(e) => result.failures.push(expr_failure(path, e)),
                            }
                        }
                        _ => result
                            .failures
                            .push(Failure::at(FailureKind::NotAnArray, path)),
                    },
                    Ok(JsonValue::String(key)) => {
                        apply_key(path, node, &key, potential_ok, next, result)
                    }
                    Ok(other) => result.failures.push(Failure::new(
                        FailureKind::Expression,
                        Some(path.to_string()),
                        format!("subscript expression produced a {}", other.type_name()),
                    )),
                    Err(e) => result.failures.push(expr_failure(path, e)),
                }
            }
        }
        Segment::Slice { from, to, step } => {
            apply_slice(path, node, *from, *to, *step, potential_ok, next, result)
        }
        Segment::ExprSlice { from, to, step } => {
            let current = source.materialize(path).unwrap_or_default();
            let mut bound = |expr: &Option<PathExpr>| -> Result<Option<i64>, ()> {
                let Some(expr) = expr else { return Ok(None) };
                match expr.eval(&current) {
                    Ok(JsonValue::Number(n)) if n.fract() == 0.0 && n.is_finite() => {
                        Ok(Some(n as i64))
                    }
                    Ok(other) => {
                        result.failures.push(Failure::new(
                            FailureKind::Expression,
                            Some(path.to_string()),
                            format!("slice bound evaluated to a {}", other.type_name()),
                        ));
                        Err(())
                    }
                    Err(e) => {
                        result.failures.push(expr_failure(path, e));
                        Err(())
                    }
                }
            };
            let (Ok(from), Ok(to), Ok(step)) = (bound(from), bound(to), bound(step)) else {
                return;
            };
            apply_slice(path, node, from, to, step, potential_ok, next, result);
        }
        Segment::Filter(expr) => {
            let children: Vec<BinaryPath> = match node {
                JsonNode::Array { len } => (0..*len).map(|i| path.append(i)).collect(),
                JsonNode::Object { keys } => {
                    keys.iter().map(|k| path.append(k.as_str())).collect()
                }
                JsonNode::Scalar(_) => return,
            };
            for child in children {
                let value = source.materialize(&child).unwrap_or_default();
                match expr.eval(&value) {
                    Ok(v) if v.is_truthy() => next.push(child),
                    Ok(_) => {}
                    Err(e) => result.failures.push(expr_failure(path, e)),
                }
            }
        }
        Segment::Recursive(inner) => {
            let mut collected = Vec::new();
            let mut descend = vec![path.clone()];
            while let Some(current) = descend.pop() {
                collected.extend(eval_segments(
                    source,
                    vec![current.clone()],
                    inner,
                    potential_ok,
                    result,
                ));
                match source.get_by_path(&current) {
                    Some(JsonNode::Array { len }) => {
                        // Reverse keeps the pre-order walk index-ascending.
                        descend.extend((0..len).rev().map(|i| current.append(i)));
                    }
                    Some(JsonNode::Object { keys }) => {
                        descend.extend(
                            keys.iter().rev().map(|k| current.append(k.as_str())),
                        );
                    }
                    _ => {}
                }
            }
            next.extend(dedup(collected));
        }
    }
}

fn apply_key(
    path: &BinaryPath,
    node: &JsonNode,
    key: &str,
    potential_ok: bool,
    next: &mut Vec<BinaryPath>,
    result: &mut QueryResult,
) {
    match node {
        JsonNode::Object { keys } => {
            let child = path.append(key);
            if keys.iter().any(|k| k == key) {
                next.push(child);
            } else if potential_ok {
                result.potential.push(child);
            }
        }
        _ => result
            .failures
            .push(Failure::at(FailureKind::NotAnObject, path)),
    }
}

fn apply_index(
    path: &BinaryPath,
    node: &JsonNode,
    index: i64,
    potential_ok: bool,
    next: &mut Vec<BinaryPath>,
    result: &mut QueryResult,
) {
    match node {
        JsonNode::Array { len } => match normalize_index(index, *len) {
            Some(i) if i < *len => next.push(path.append(i)),
            Some(i) => {
                if potential_ok {
                    result.potential.push(path.append(i));
                }
            }
            None => result
                .failures
                .push(Failure::at(FailureKind::PathDoesNotExist, path)),
        },
        _ => result
            .failures
            .push(Failure::at(FailureKind::NotAnArray, path)),
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_slice(
    path: &BinaryPath,
    node: &JsonNode,
    from: Option<i64>,
    to: Option<i64>,
    step: Option<i64>,
    potential_ok: bool,
    next: &mut Vec<BinaryPath>,
    result: &mut QueryResult,
) {
    let JsonNode::Array { len } = node else {
        result
            .failures
            .push(Failure::at(FailureKind::NotAnArray, path));
        return;
    };
    let len = *len as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        result
            .failures
            .push(Failure::at(FailureKind::SliceStepZero, path));
        return;
    }
    let wrap = |x: i64| if x < 0 { x + len } else { x };
    if step > 0 {
        let start = from.map(wrap).unwrap_or(0).max(0);
        let end = to.map(wrap).unwrap_or(len);
        let mut i = start;
        while i < end {
            if i < len {
                next.push(path.append(i as u32));
            } else if potential_ok {
                // Beyond the current length but inside an explicit bound:
                // a hole-fillable write target.
                result.potential.push(path.append(i as u32));
            } else {
                break;
            }
            i += step;
        }
    } else {
        let start = from.map(wrap).unwrap_or(len - 1).min(len - 1);
        let end = to.map(wrap).unwrap_or(-1).max(-1);
        let mut i = start;
        while i > end {
            if (0..len).contains(&i) {
                next.push(path.append(i as u32));
            }
            i += step;
        }
    }
}

/// Negative indices wrap by whole array lengths until non-negative; an empty
/// array has nothing to wrap against.
fn normalize_index(index: i64, len: u32) -> Option<u32> {
    if index >= 0 {
        return Some(index as u32);
    }
    if len == 0 {
        return None;
    }
    let mut i = index;
    while i < 0 {
        i += len as i64;
    }
    Some(i as u32)
}

fn expr_failure(path: &BinaryPath, e: super::JsonPathError) -> Failure {
    Failure::new(FailureKind::Expression, Some(path.to_string()), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_source::{OverlayArena, OverlayId};
    use crate::jsonpath::parse;
    use serde_json::json;

    fn arena_with(value: serde_json::Value) -> (OverlayArena, OverlayId) {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(base, &BinaryPath::ROOT, &value.into(), None)
            .unwrap();
        (arena, base)
    }

    fn run(arena: &OverlayArena, base: OverlayId, path: &str) -> QueryResult {
        query_paths(&arena.source(base), &parse(path).unwrap())
    }

    fn p(indices: &[&str]) -> BinaryPath {
        indices.iter().copied().collect()
    }

    #[test]
    fn keys_and_indices() {
        let (arena, base) = arena_with(json!({"a": {"b": [10, 20]}}));
        let r = run(&arena, base, "$.a.b[1]");
        assert_eq!(r.existing, vec![p(&["a", "b"]).append(1u32)]);
        assert!(r.potential.is_empty() && r.failures.is_empty());

        let r = run(&arena, base, "$.a.b[-1]");
        assert_eq!(r.existing, vec![p(&["a", "b"]).append(1u32)]);

        let r = run(&arena, base, "$.a.b[5]");
        assert!(r.existing.is_empty());
        assert_eq!(r.potential, vec![p(&["a", "b"]).append(5u32)]);
    }

    #[test]
    fn new_key_is_potential_only_at_the_end() {
        let (arena, base) = arena_with(json!({"a": {}}));
        let r = run(&arena, base, "$.a.fresh");
        assert_eq!(r.potential, vec![p(&["a", "fresh"])]);
        // Missing intermediate: no target at all.
        let r = run(&arena, base, "$.missing.leaf");
        assert!(r.existing.is_empty() && r.potential.is_empty() && r.failures.is_empty());
    }

    #[test]
    fn type_mismatch_is_a_failure() {
        let (arena, base) = arena_with(json!({"a": 1, "b": [1]}));
        let r = run(&arena, base, "$.a.x");
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.failures[0].kind, FailureKind::NotAnObject);
        let r = run(&arena, base, "$.a[0]");
        assert_eq!(r.failures[0].kind, FailureKind::NotAnArray);
        let r = run(&arena, base, "$.b[0:0:0]");
        assert_eq!(r.failures[0].kind, FailureKind::SliceStepZero);
    }

    #[test]
    fn wildcard_and_filter() {
        let (arena, base) = arena_with(json!({
            "items": [{"price": 5}, {"price": 15}, {"price": 25}]
        }));
        let r = run(&arena, base, "$.items[*]");
        assert_eq!(r.existing.len(), 3);
        let r = run(&arena, base, "$.items[?(@.price > 10)]");
        assert_eq!(
            r.existing,
            vec![p(&["items"]).append(1u32), p(&["items"]).append(2u32)]
        );
    }

    #[test]
    fn slices_follow_python_rules() {
        let (arena, base) = arena_with(json!({"a": [0, 1, 2, 3, 4]}));
        let idx = |i: u32| p(&["a"]).append(i);
        let r = run(&arena, base, "$.a[1:4:2]");
        assert_eq!(r.existing, vec![idx(1), idx(3)]);
        let r = run(&arena, base, "$.a[::-2]");
        assert_eq!(r.existing, vec![idx(4), idx(2), idx(0)]);
        let r = run(&arena, base, "$.a[-2:]");
        assert_eq!(r.existing, vec![idx(3), idx(4)]);
        let r = run(&arena, base, "$.a[3:7]");
        assert_eq!(r.existing, vec![idx(3), idx(4)]);
        assert_eq!(r.potential, vec![idx(5), idx(6)]);
    }

    #[test]
    fn recursive_descent_dedupes() {
        // Scenario: keys "bar" at several depths, queried via $..bar.
        let (arena, base) = arena_with(json!({
            "foo": {"bar": 1, "baz": 2},
            "bar": {"foo": 3, "bar": 4, "baz": 5}
        }));
        let r = run(&arena, base, "$..bar");
        let mut got = r.existing.clone();
        got.sort();
        let mut want = vec![p(&["bar"]), p(&["bar", "bar"]), p(&["foo", "bar"])];
        want.sort();
        assert_eq!(got, want);
        assert!(r.potential.is_empty());
    }

    #[test]
    fn expr_index_subscripts() {
        let (arena, base) = arena_with(json!({"a": [10, 20, 30], "cursor": 1}));
        let r = run(&arena, base, "$.a[(@[1] == 20 ? 0 : 2)]");
        assert_eq!(r.existing, vec![p(&["a"]).append(0u32)]);
    }

    #[test]
    fn multi_key_union() {
        let (arena, base) = arena_with(json!({"a": 1, "b": 2, "c": 3}));
        let r = run(&arena, base, "$['a', 'c']");
        assert_eq!(r.existing, vec![p(&["a"]), p(&["c"])]);
    }
}
