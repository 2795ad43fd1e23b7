use fxhash::FxHashMap;
use itertools::Itertools;
use osmosis_common::{AuthorId, Failure, Id, OsmosisResult, StateHash, StoreError};
use tracing::{debug, trace};

use super::{InsertResult, SavePoint, StateSummary};
use crate::action::{apply_change, Op};
use crate::compiler::compile_action;
use crate::json_source::{OverlayArena, OverlayId, SourceRef};

/// Ops between save-points before a new one is considered.
pub const MIN_SAVE_POINT_WIDTH: u64 = 4;

/// The log/ladder machinery shared by every [super::SaveState] backend: a
/// strictly id-sorted op log, the failure log, the overlay arena with the
/// save-point ladder, and the rolling state hash.
#[derive(Debug, Clone)]
pub struct SaveStateCore {
    arena: OverlayArena,
    live: OverlayId,
    ops: Vec<Op>,
    failures: Vec<Failure>,
    save_points: Vec<SavePoint>,
    hash: StateHash,
    latest_indexes: FxHashMap<AuthorId, u64>,
    ops_since_save_point: u64,
}

impl Default for SaveStateCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SaveStateCore {
    pub fn new() -> Self {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        let live = arena.new_child(base);
        SaveStateCore {
            arena,
            live,
            ops: Vec::new(),
            failures: Vec::new(),
            save_points: vec![SavePoint {
                id: Id::ZERO,
                width: MIN_SAVE_POINT_WIDTH,
                hash: StateHash::ZERO,
                latest_indexes: FxHashMap::default(),
                overlay: base,
            }],
            hash: StateHash::ZERO,
            latest_indexes: FxHashMap::default(),
            ops_since_save_point: 0,
        }
    }

    /// Rebuilds a core from persisted parts: the save-point ladder (oldest
    /// first, overlays already imported into `arena` and chained), the op
    /// log, and the failure log. Ops after the last save-point are replayed
    /// to reconstruct the live overlay.
    pub fn from_parts(
        arena: OverlayArena,
        save_points: Vec<SavePoint>,
        ops: Vec<Op>,
        failures: Vec<Failure>,
    ) -> OsmosisResult<Self> {
        let last = save_points
            .last()
            .ok_or_else(|| StoreError::Decode("no save points".into()))?;
        let mut core = SaveStateCore {
            live: OverlayId::default(),
            hash: last.hash,
            latest_indexes: last.latest_indexes.clone(),
            arena,
            save_points,
            ops,
            failures: Vec::new(),
            ops_since_save_point: 0,
        };
        core.live = core
            .arena
            .new_child(core.save_points.last().expect("non-empty").overlay);
        let tail_start = partition_by_id(&core.ops, |id| {
            id <= core.save_points.last().expect("non-empty").id
        });
        let tail: Vec<Op> = core.ops[tail_start..].to_vec();
        for op in &tail {
            core.apply_op(op, &mut InsertResult::default());
            core.ops_since_save_point += 1;
        }
        // Replay regenerated the tail's failures; splice the persisted ones
        // (which cover the baked-in prefix) in front.
        let mut all = failures;
        all.retain(|f| f.id.is_some_and(|id| id <= last_save_point_id(&core.save_points)));
        all.append(&mut core.failures);
        core.failures = all;
        Ok(core)
    }

    pub fn arena(&self) -> &OverlayArena {
        &self.arena
    }

    pub fn source(&self) -> SourceRef<'_> {
        self.arena.source(self.live)
    }

    pub fn save_points(&self) -> &[SavePoint] {
        &self.save_points
    }

    pub fn last_applied(&self) -> Id {
        self.ops.last().map(|op| op.id).unwrap_or(Id::ZERO)
    }

    pub fn state_summary(&self) -> StateSummary {
        StateSummary {
            hash: self.hash,
            latest_indexes: self.latest_indexes.clone(),
        }
    }

    /// Ops applied since the newest save-point (what a "recent" file has to
    /// carry).
    pub fn recent_ops(&self) -> &[Op] {
        let last = last_save_point_id(&self.save_points);
        let start = partition_by_id(&self.ops, |id| id <= last);
        &self.ops[start..]
    }

    pub fn recent_failures(&self) -> Vec<Failure> {
        let last = last_save_point_id(&self.save_points);
        self.failures
            .iter()
            .filter(|f| f.id.is_none() || f.id.is_some_and(|id| id > last))
            .cloned()
            .collect()
    }

    pub fn insert(&mut self, mut ops: Vec<Op>) -> OsmosisResult<InsertResult> {
        ops.sort_by_key(|op| op.id);
        ops.dedup_by_key(|op| op.id);
        ops.retain(|op| !self.contains(op.id));
        let mut result = InsertResult::default();
        let Some(first) = ops.first() else {
            return Ok(result);
        };
        debug!(count = ops.len(), first = %first.id, "inserting ops");

        let mut merged = ops;
        if first_le_tail(&merged, self.last_applied()) {
            let target = self.greatest_applied_below(merged[0].id);
            let dropped = self.rewind(target)?;
            trace!(
                target = %target,
                replayed = dropped.len(),
                "rewound for out-of-order insert"
            );
            merged = merged
                .into_iter()
                .merge_by(dropped, |a, b| a.id <= b.id)
                .collect();
        }

        for op in merged {
            self.apply_op(&op, &mut result);
            self.ops.push(op);
            self.ops_since_save_point += 1;
            self.consider_save_point();
        }
        Ok(result)
    }

    pub fn ops_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Op> {
        let start = lo
            .map(|lo| partition_by_id(&self.ops, |id| id < lo))
            .unwrap_or(0);
        let end = hi
            .map(|hi| partition_by_id(&self.ops, |id| id <= hi))
            .unwrap_or(self.ops.len());
        self.ops[start..end.max(start)].to_vec()
    }

    pub fn failures_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Failure> {
        self.failures
            .iter()
            .filter(|f| {
                let Some(id) = f.id else { return false };
                lo.map_or(true, |lo| id >= lo) && hi.map_or(true, |hi| id <= hi)
            })
            .cloned()
            .collect()
    }

    /// Rewinds to the state as of `id`: restores the nearest save-point at
    /// or below it, replays the ops in between, and removes and returns
    /// everything newer.
    pub fn rewind(&mut self, id: Id) -> OsmosisResult<Vec<Op>> {
        let keep = self
            .save_points
            .partition_point(|sp| sp.id <= id)
            .checked_sub(1)
            .ok_or(StoreError::RewindPastOldestSavePoint(id))?;
        debug!(to = %id, save_point = %self.save_points[keep].id, "rewinding");

        self.arena.free(self.live);
        for sp in self.save_points.drain(keep + 1..) {
            self.arena.free(sp.overlay);
        }
        let base = &self.save_points[keep];
        self.live = self.arena.new_child(base.overlay);
        self.hash = base.hash;
        self.latest_indexes = base.latest_indexes.clone();
        let base_id = base.id;

        let replay_start = partition_by_id(&self.ops, |op| op <= base_id);
        let drop_start = partition_by_id(&self.ops, |op| op <= id);
        let dropped = self.ops.split_off(drop_start);
        let replay: Vec<Op> = self.ops[replay_start..].to_vec();
        self.failures
            .retain(|f| f.id.is_some_and(|fid| fid <= base_id));

        let mut scratch = InsertResult::default();
        for op in &replay {
            self.apply_op(op, &mut scratch);
        }
        self.ops_since_save_point = replay.len() as u64;
        Ok(dropped)
    }

    /// Drops history below `id`. Ops needed to replay from the surviving
    /// base stay regardless.
    pub fn garbage_collect(&mut self, id: Id) -> OsmosisResult<()> {
        let keep = self
            .save_points
            .partition_point(|sp| sp.id < id)
            .min(self.save_points.len() - 1);
        if keep > 0 {
            debug!(below = %id, dropped = keep, "collecting save points");
            let survivor = self.save_points[keep].overlay;
            while self.arena.parent_of(survivor).is_some() {
                self.arena.absorb_parent(survivor);
            }
            self.save_points.drain(..keep);
        }
        let base_id = self.save_points[0].id;
        self.ops.retain(|op| op.id >= id || op.id > base_id);
        self.failures
            .retain(|f| f.id.is_some_and(|fid| fid >= id || fid > base_id));
        Ok(())
    }

    fn contains(&self, id: Id) -> bool {
        self.ops.binary_search_by_key(&id, |op| op.id).is_ok()
    }

    fn greatest_applied_below(&self, id: Id) -> Id {
        let idx = partition_by_id(&self.ops, |op| op < id);
        idx.checked_sub(1)
            .map(|i| self.ops[i].id)
            .unwrap_or(Id::ZERO)
    }

    /// Compile, apply, advance the hash and the per-author summary. The op
    /// is *not* appended to the log; callers that extend the log push it
    /// themselves (rewind replays ops that are already there).
    fn apply_op(&mut self, op: &Op, result: &mut InsertResult) {
        let compiled = compile_action(&mut self.arena, self.live, &op.action);
        for failure in compiled.failures {
            let failure = failure.with_id(op.id);
            self.failures.push(failure.clone());
            result.failures.push(failure);
        }
        for change in compiled.changes {
            match apply_change(&mut self.arena, self.live, &change, Some(op.id)) {
                Ok(()) => result.changes.push(change),
                Err(e) => {
                    let failure = Failure::new(
                        osmosis_common::FailureKind::MalformedOp,
                        None,
                        e.to_string(),
                    )
                    .with_id(op.id);
                    self.failures.push(failure.clone());
                    result.failures.push(failure);
                }
            }
        }
        self.hash = self.hash.advance(op.id);
        let latest = op.id.index + op.action.index_width() - 1;
        self.latest_indexes
            .entry(op.id.author)
            .and_modify(|v| *v = (*v).max(latest))
            .or_insert(latest);
    }

    fn consider_save_point(&mut self) {
        if self.ops_since_save_point < MIN_SAVE_POINT_WIDTH {
            return;
        }
        let id = self.last_applied();
        if id <= last_save_point_id(&self.save_points) {
            return;
        }
        trace!(at = %id, "adding save point");
        let frozen = self.live;
        self.save_points.push(SavePoint {
            id,
            width: MIN_SAVE_POINT_WIDTH,
            hash: self.hash,
            latest_indexes: self.latest_indexes.clone(),
            overlay: frozen,
        });
        self.live = self.arena.new_child(frozen);
        self.ops_since_save_point = 0;
        self.compact_ladder();
    }

    /// Tail-backward compaction pass. Whenever two rungs two apart carry the
    /// same width, the one between them folds into its successor and the
    /// older rung doubles. The scan starts far enough from the tail that the
    /// just-added save-point is never a comparand, which yields the
    /// logarithmic distribution (and keeps the first three rungs intact).
    fn compact_ladder(&mut self) {
        let mut i = self.save_points.len() as i64 - 4;
        while i >= 0 {
            let i_usize = i as usize;
            if self.save_points[i_usize].width == self.save_points[i_usize + 2].width {
                let removed = self.save_points.remove(i_usize + 1);
                trace!(merged = %removed.id, into = %self.save_points[i_usize + 1].id, "merging save point");
                // The successor (now at i+1) absorbs the removed rung's
                // overlay, which is its direct parent.
                debug_assert_eq!(
                    self.arena.parent_of(self.save_points[i_usize + 1].overlay),
                    Some(removed.overlay)
                );
                self.arena.absorb_parent(self.save_points[i_usize + 1].overlay);
                self.save_points[i_usize].width *= 2;
            }
            i -= 1;
        }
    }
}

fn last_save_point_id(save_points: &[SavePoint]) -> Id {
    save_points.last().map(|sp| sp.id).unwrap_or(Id::ZERO)
}

fn first_le_tail(ops: &[Op], tail: Id) -> bool {
    ops.first().is_some_and(|op| op.id <= tail)
}

fn partition_by_id(ops: &[Op], pred: impl Fn(Id) -> bool) -> usize {
    ops.partition_point(|op| pred(op.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, PathRef, ScalarAction};
    use crate::json_source::JsonSource;
    use crate::jsonpath::parse;
    use osmosis_common::BinaryPath;
    use pretty_assertions::assert_eq;

    fn author(byte: u8) -> AuthorId {
        AuthorId::from_bytes([byte; 16])
    }

    fn set_op(author_byte: u8, index: u64, key: &str, value: i32) -> Op {
        Op {
            id: Id::new(author(author_byte), index),
            action: Action::Scalar(ScalarAction::Set {
                path: PathRef::Compiled(parse(&format!("$.{key}")).unwrap()),
                value: value.into(),
            }),
        }
    }

    fn doc(core: &SaveStateCore) -> serde_json::Value {
        core.source()
            .materialize(&BinaryPath::ROOT)
            .unwrap()
            .into()
    }

    #[test]
    fn save_point_ladder_after_eight_ops() {
        let mut core = SaveStateCore::new();
        for i in 1..=8 {
            core.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
        }
        let ids: Vec<Id> = core.save_points().iter().map(|sp| sp.id).collect();
        let widths: Vec<u64> = core.save_points().iter().map(|sp| sp.width).collect();
        assert_eq!(
            ids,
            vec![Id::ZERO, Id::new(author(1), 4), Id::new(author(1), 8)]
        );
        assert_eq!(widths, vec![4, 4, 4]);
    }

    #[test]
    fn ladder_compacts_logarithmically() {
        let mut core = SaveStateCore::new();
        for i in 1..=28 {
            core.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
        }
        let summary: Vec<(u64, u64)> = core
            .save_points()
            .iter()
            .map(|sp| (sp.id.index, sp.width))
            .collect();
        assert_eq!(summary, vec![(0, 16), (16, 8), (24, 4), (28, 4)]);
        // The surviving chain still reconstructs the document.
        assert_eq!(doc(&core)["k"], serde_json::json!(28.0));
    }

    #[test]
    fn out_of_order_insert_converges() {
        let op_a = set_op(1, 1, "a", 1);
        let op_b = set_op(2, 1, "b", 2);
        let op_c = set_op(3, 1, "c", 3);

        let mut forward = SaveStateCore::new();
        forward.insert(vec![op_a.clone()]).unwrap();
        forward.insert(vec![op_b.clone()]).unwrap();
        forward.insert(vec![op_c.clone()]).unwrap();

        let mut backward = SaveStateCore::new();
        backward.insert(vec![op_c.clone()]).unwrap();
        backward.insert(vec![op_b.clone()]).unwrap();
        backward.insert(vec![op_a.clone()]).unwrap();

        assert_eq!(doc(&forward), doc(&backward));
        assert_eq!(forward.state_summary(), backward.state_summary());
        let forward_ids: Vec<Id> = forward.ops_range(None, None).iter().map(|o| o.id).collect();
        let backward_ids: Vec<Id> =
            backward.ops_range(None, None).iter().map(|o| o.id).collect();
        assert_eq!(forward_ids, backward_ids);
        assert!(forward_ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn duplicate_ops_are_ignored() {
        let op = set_op(1, 1, "a", 1);
        let mut core = SaveStateCore::new();
        core.insert(vec![op.clone(), op.clone()]).unwrap();
        let second = core.insert(vec![op.clone()]).unwrap();
        assert!(second.changes.is_empty());
        assert_eq!(core.ops_range(None, None).len(), 1);
        assert_eq!(
            core.state_summary().hash,
            StateHash::ZERO.advance(op.id)
        );
    }

    #[test]
    fn rewind_restores_hash_and_replay_recovers() {
        let mut core = SaveStateCore::new();
        for i in 1..=10 {
            core.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
        }
        let full = core.state_summary();
        let target = Id::new(author(1), 6);
        let dropped = core.rewind(target).unwrap();
        assert_eq!(dropped.len(), 4);
        assert_eq!(core.last_applied(), target);
        assert_eq!(doc(&core)["k"], serde_json::json!(6.0));

        core.insert(dropped).unwrap();
        assert_eq!(core.state_summary(), full);
        assert_eq!(doc(&core)["k"], serde_json::json!(10.0));
    }

    #[test]
    fn rewind_past_oldest_save_point_fails() {
        let mut core = SaveStateCore::new();
        for i in 1..=12 {
            core.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
        }
        core.garbage_collect(Id::new(author(1), 8)).unwrap();
        let err = core.rewind(Id::new(author(1), 2)).unwrap_err();
        assert!(matches!(err, StoreError::RewindPastOldestSavePoint(_)));
    }

    #[test]
    fn garbage_collect_keeps_recent_history() {
        let mut core = SaveStateCore::new();
        for i in 1..=12 {
            core.insert(vec![set_op(1, i, "k", i as i32)]).unwrap();
        }
        let before = doc(&core);
        core.garbage_collect(Id::new(author(1), 8)).unwrap();
        assert_eq!(doc(&core), before);
        assert!(core.save_points()[0].id >= Id::new(author(1), 8));
        // Tail ops survive for range queries and replay.
        assert!(!core.ops_range(Some(Id::new(author(1), 9)), None).is_empty());
        assert!(core
            .ops_range(None, Some(Id::new(author(1), 7)))
            .is_empty());
    }

    #[test]
    fn failures_attach_to_op_ids() {
        let mut core = SaveStateCore::new();
        let op = Op {
            id: Id::new(author(1), 1),
            action: Action::Scalar(ScalarAction::Add {
                path: PathRef::Compiled(parse("$.missing").unwrap()),
                amount: 1.0,
            }),
        };
        let result = core.insert(vec![op]).unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].id, Some(Id::new(author(1), 1)));
        assert_eq!(core.failures_range(None, None).len(), 1);
        // Failed ops still advance the hash.
        assert_ne!(core.state_summary().hash, StateHash::ZERO);
    }
}
