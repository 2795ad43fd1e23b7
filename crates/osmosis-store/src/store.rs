//! The user-facing dispatcher: compiles path strings, splits multi-match
//! actions into singular anchored ops, assigns ids, feeds the save state,
//! and notifies live queries.

use fxhash::FxHashMap;
use osmosis_common::{
    AuthorId, BinaryPath, Failure, FailureKind, Id, JsonValue, OsmosisFailureError,
    OsmosisResult, StoreError,
};
use tracing::debug;
use uuid::Uuid;

use crate::action::{Action, Change, Op, PathRef, ScalarAction};
use crate::json_source::JsonSource;
use crate::jsonpath::{
    anchor, could_match, interpolate, parse, query_paths, CompiledJsonPath, QueryResult, Segment,
};
use crate::save_state::{InsertResult, SaveState, StateSummary};
use crate::subscription::{SubscriberCallback, Subscription, SubscriptionRegistry};

pub type Vars = FxHashMap<String, JsonValue>;

/// Outcome of a local dispatch: the ops that entered the log, the changes
/// their application produced, and every failure collected along the way.
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub ops: Vec<Op>,
    pub changes: Vec<Change>,
    pub failures: Vec<Failure>,
}

impl DispatchResult {
    /// For dispatchers that prefer an error to inspecting the failure list.
    pub fn into_result(self) -> Result<Vec<Op>, OsmosisFailureError> {
        if self.failures.is_empty() {
            Ok(self.ops)
        } else {
            Err(OsmosisFailureError {
                failures: self.failures,
            })
        }
    }
}

/// A replicated JSON document. All mutation funnels through [Store::dispatch]
/// (local edits) or [Store::merge_ops] (ops received from peers); both keep
/// every peer's log, document and state hash convergent.
pub struct Store<S: SaveState> {
    save_state: S,
    author: AuthorId,
    next_index: u64,
    subscriptions: SubscriptionRegistry,
}

impl<S: SaveState> Store<S> {
    /// Opens a store over a save state. The peer identity is loaded from the
    /// save state's metadata, minted on first use; the next op index resumes
    /// above everything the log has seen.
    pub fn new(mut save_state: S) -> OsmosisResult<Self> {
        let metadata = save_state.init_metadata(&mut || {
            let mut map = indexmap::IndexMap::new();
            map.insert(
                "peer_id".to_string(),
                JsonValue::String(Uuid::new_v4().to_string()),
            );
            JsonValue::Map(map)
        })?;
        let author = metadata
            .as_map()
            .and_then(|m| m.get("peer_id"))
            .and_then(|v| v.as_string())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| StoreError::Decode("metadata has no usable peer_id".into()))?;
        let summary = save_state.state_summary();
        let next_index = summary
            .latest_indexes
            .values()
            .max()
            .map(|max| max + 1)
            .unwrap_or(1);
        debug!(author = %author, next_index, "opening store");
        Ok(Store {
            save_state,
            author,
            next_index,
            subscriptions: SubscriptionRegistry::default(),
        })
    }

    pub fn author(&self) -> AuthorId {
        self.author
    }

    pub fn save_state(&self) -> &S {
        &self.save_state
    }

    pub fn state_summary(&self) -> StateSummary {
        self.save_state.state_summary()
    }

    /// The current document value.
    pub fn value(&self) -> JsonValue {
        self.save_state
            .source()
            .materialize(&BinaryPath::ROOT)
            .unwrap_or_default()
    }

    /// Compiles and applies a local action. Path strings may reference
    /// `{variables}`.
    pub fn dispatch(
        &mut self,
        action: Action<String>,
        vars: &Vars,
    ) -> OsmosisResult<DispatchResult> {
        let mut failures = Vec::new();
        let actions = match action {
            Action::Scalar(scalar) => {
                let compiled = self.compile_scalar_paths(scalar, vars)?;
                self.split_into_singular(compiled, &mut failures)
            }
            Action::Transaction(actions) => {
                // Later sub-actions may target paths earlier ones create, so
                // transactions ship compiled paths unsplit and let the
                // action compiler resolve them against its scratch overlay.
                let compiled = actions
                    .into_iter()
                    .map(|scalar| {
                        Ok(self
                            .compile_scalar_paths(scalar, vars)?
                            .map_paths(PathRef::Compiled))
                    })
                    .collect::<OsmosisResult<Vec<_>>>()?;
                vec![Action::Transaction(compiled)]
            }
        };

        let mut ops = Vec::with_capacity(actions.len());
        for action in actions {
            let id = Id::new(self.author, self.next_index);
            self.next_index += action.index_width();
            ops.push(Op { id, action });
        }
        let inserted = self.merge_ops(ops.clone())?;
        failures.extend(inserted.failures);
        Ok(DispatchResult {
            ops,
            changes: inserted.changes,
            failures,
        })
    }

    /// Applies ops (local or from peers) and notifies affected live queries
    /// once the whole batch is in.
    pub fn merge_ops(&mut self, ops: Vec<Op>) -> OsmosisResult<InsertResult> {
        let result = self.save_state.insert(ops)?;
        if !result.changes.is_empty() && !self.subscriptions.is_empty() {
            let changed: Vec<BinaryPath> = result
                .changes
                .iter()
                .flat_map(|change| change.touched_paths().cloned())
                .collect();
            for entry in self.subscriptions.entries() {
                if changed.iter().any(|path| could_match(&entry.compiled, path)) {
                    let values = self.evaluate(&entry.compiled);
                    (*entry.callback)(&values);
                }
            }
        }
        Ok(result)
    }

    /// Registers a live query. The callback fires once immediately with the
    /// current result, then after every batch of ops that may affect it.
    pub fn subscribe(
        &mut self,
        path: &str,
        vars: &Vars,
        callback: SubscriberCallback,
    ) -> OsmosisResult<Subscription> {
        let compiled = self.compile_path(path, vars)?;
        let values = self.evaluate(&compiled);
        (*callback)(&values);
        Ok(self.subscriptions.insert(compiled, callback))
    }

    /// Synchronous single-shot query.
    pub fn query_once(&self, path: &str, vars: &Vars) -> OsmosisResult<Vec<JsonValue>> {
        let compiled = self.compile_path(path, vars)?;
        Ok(self.evaluate(&compiled))
    }

    /// Single-shot query returning concrete paths instead of values.
    pub fn query_paths_once(&self, path: &str, vars: &Vars) -> OsmosisResult<QueryResult> {
        let compiled = self.compile_path(path, vars)?;
        Ok(query_paths(&self.save_state.source(), &compiled))
    }

    fn evaluate(&self, compiled: &CompiledJsonPath) -> Vec<JsonValue> {
        let source = self.save_state.source();
        query_paths(&source, compiled)
            .existing
            .iter()
            .filter_map(|path| source.materialize(path))
            .collect()
    }

    fn compile_path(&self, path: &str, vars: &Vars) -> OsmosisResult<CompiledJsonPath> {
        let interpolated = interpolate(path, vars)?;
        Ok(parse(&interpolated)?)
    }

    fn compile_scalar_paths(
        &self,
        scalar: ScalarAction<String>,
        vars: &Vars,
    ) -> OsmosisResult<ScalarAction<CompiledJsonPath>> {
        let mut error = None;
        let compiled = scalar.map_paths(|path| match self.compile_path(&path, vars) {
            Ok(compiled) => compiled,
            Err(e) => {
                error.get_or_insert(e);
                CompiledJsonPath::default()
            }
        });
        match error {
            Some(e) => Err(e),
            None => Ok(compiled),
        }
    }

    /// Resolves a compiled action against the live document, producing one
    /// anchored scalar action per concrete target.
    fn split_into_singular(
        &self,
        scalar: ScalarAction<CompiledJsonPath>,
        failures: &mut Vec<Failure>,
    ) -> Vec<Action<PathRef>> {
        match scalar {
            ScalarAction::Set { path, value } => self
                .targets(&path, true, failures)
                .into_iter()
                .map(|path| {
                    Action::Scalar(ScalarAction::Set {
                        path,
                        value: value.clone(),
                    })
                })
                .collect(),
            ScalarAction::Delete { path } => self
                .targets(&path, false, failures)
                .into_iter()
                .map(|path| Action::Scalar(ScalarAction::Delete { path }))
                .collect(),
            ScalarAction::InitArray { path } => self
                .targets(&path, true, failures)
                .into_iter()
                .map(|path| Action::Scalar(ScalarAction::InitArray { path }))
                .collect(),
            ScalarAction::InitObject { path } => self
                .targets(&path, true, failures)
                .into_iter()
                .map(|path| Action::Scalar(ScalarAction::InitObject { path }))
                .collect(),
            ScalarAction::InsertBefore { path, value } => self
                .targets(&path, true, failures)
                .into_iter()
                .map(|path| {
                    Action::Scalar(ScalarAction::InsertBefore {
                        path,
                        value: value.clone(),
                    })
                })
                .collect(),
            ScalarAction::InsertAfter { path, value } => self
                .targets(&path, true, failures)
                .into_iter()
                .map(|path| {
                    Action::Scalar(ScalarAction::InsertAfter {
                        path,
                        value: value.clone(),
                    })
                })
                .collect(),
            ScalarAction::InsertUnique { path, value } => self
                .targets(&path, false, failures)
                .into_iter()
                .map(|path| {
                    Action::Scalar(ScalarAction::InsertUnique {
                        path,
                        value: value.clone(),
                    })
                })
                .collect(),
            ScalarAction::Add { path, amount } => self
                .targets(&path, false, failures)
                .into_iter()
                .map(|path| Action::Scalar(ScalarAction::Add { path, amount }))
                .collect(),
            ScalarAction::Multiply { path, factor } => self
                .targets(&path, false, failures)
                .into_iter()
                .map(|path| Action::Scalar(ScalarAction::Multiply { path, factor }))
                .collect(),
            ScalarAction::Move { from, to } => {
                let Some(src) = self.single(&from, false, failures) else {
                    return Vec::new();
                };
                let Some(dst) = self.single(&to, true, failures) else {
                    return Vec::new();
                };
                vec![Action::Scalar(ScalarAction::Move {
                    from: self.anchored(&src),
                    to: self.anchored(&dst),
                })]
            }
            ScalarAction::Copy { from, to } => {
                let Some(src) = self.single(&from, false, failures) else {
                    return Vec::new();
                };
                let from = self.anchored(&src);
                self.targets(&to, true, failures)
                    .into_iter()
                    .map(|to| {
                        Action::Scalar(ScalarAction::Copy {
                            from: from.clone(),
                            to,
                        })
                    })
                    .collect()
            }
        }
    }

    /// Concrete anchored targets of one compiled path, recording query
    /// failures (and a `PathDoesNotExist` when nothing matches at all).
    fn targets(
        &self,
        compiled: &CompiledJsonPath,
        include_potential: bool,
        failures: &mut Vec<Failure>,
    ) -> Vec<PathRef> {
        let q = query_paths(&self.save_state.source(), compiled);
        let had_failures = !q.failures.is_empty();
        failures.extend(q.failures);
        let mut targets = q.existing;
        if include_potential {
            targets.extend(q.potential);
        }
        if targets.is_empty() && !had_failures {
            failures.push(Failure::at(FailureKind::PathDoesNotExist, compiled));
        }
        targets.iter().map(|t| self.anchored(t)).collect()
    }

    fn single(
        &self,
        compiled: &CompiledJsonPath,
        include_potential: bool,
        failures: &mut Vec<Failure>,
    ) -> Option<BinaryPath> {
        let q = query_paths(&self.save_state.source(), compiled);
        let had_failures = !q.failures.is_empty();
        failures.extend(q.failures);
        let mut targets = q.existing;
        if include_potential {
            targets.extend(q.potential);
        }
        match targets.len() {
            0 => {
                if !had_failures {
                    failures.push(Failure::at(FailureKind::PathDoesNotExist, compiled));
                }
                None
            }
            1 => targets.into_iter().next(),
            _ => {
                failures.push(Failure::at(FailureKind::MoreThanOnePath, compiled));
                None
            }
        }
    }

    /// Pins a concrete target to the nearest owning id so the shipped op
    /// survives sibling reshuffles on other peers.
    fn anchored(&self, target: &BinaryPath) -> PathRef {
        match anchor(&self.save_state.source(), target) {
            Ok(Some(id_path)) => PathRef::Anchored(id_path),
            _ => PathRef::Compiled(compiled_from_binary(target)),
        }
    }
}

/// A concrete binary path re-expressed as compiled segments (used when a
/// dispatch target has no id anywhere on its prefix to anchor to).
fn compiled_from_binary(path: &BinaryPath) -> CompiledJsonPath {
    CompiledJsonPath(
        path.iter()
            .filter_map(|index| index.ok().map(Segment::from))
            .collect(),
    )
}
