//! High-level edits and the primitive changes they compile down to. An
//! [Action] targets JSONPath-selected locations; the compiler in
//! [crate::compiler] lowers it to an ordered list of [Change]s against the
//! current document state.

use osmosis_common::{BinaryPath, Id, JsonValue, OsmosisResult};
use serde::{Deserialize, Serialize};

use crate::json_source::{JsonSource, OverlayArena, OverlayId};
use crate::jsonpath::{
    query_paths, query_paths_from, CompiledJsonIdPath, CompiledJsonPath, QueryResult,
};

/// A compiled path as carried inside an op: either a plain absolute path or
/// one anchored to an op id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathRef {
    Compiled(CompiledJsonPath),
    Anchored(CompiledJsonIdPath),
}

impl PathRef {
    pub fn query(&self, source: &impl JsonSource) -> QueryResult {
        match self {
            PathRef::Compiled(compiled) => query_paths(source, compiled),
            PathRef::Anchored(anchored) => {
                let (base, suffix) = anchored.resolve(source);
                query_paths_from(source, base, &suffix)
            }
        }
    }
}

impl std::fmt::Display for PathRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathRef::Compiled(compiled) => write!(f, "{compiled}"),
            PathRef::Anchored(anchored) => write!(f, "{anchored}"),
        }
    }
}

/// A single edit. `P` is a path string at the dispatch surface and a
/// [PathRef] once compiled into an op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarAction<P> {
    Set { path: P, value: JsonValue },
    Delete { path: P },
    InitArray { path: P },
    InitObject { path: P },
    InsertBefore { path: P, value: JsonValue },
    InsertAfter { path: P, value: JsonValue },
    InsertUnique { path: P, value: JsonValue },
    Move { from: P, to: P },
    Copy { from: P, to: P },
    Add { path: P, amount: f64 },
    Multiply { path: P, factor: f64 },
}

impl<P> ScalarAction<P> {
    /// The action's path(s), source first.
    pub fn paths(&self) -> Vec<&P> {
        match self {
            ScalarAction::Set { path, .. }
            | ScalarAction::Delete { path }
            | ScalarAction::InitArray { path }
            | ScalarAction::InitObject { path }
            | ScalarAction::InsertBefore { path, .. }
            | ScalarAction::InsertAfter { path, .. }
            | ScalarAction::InsertUnique { path, .. }
            | ScalarAction::Add { path, .. }
            | ScalarAction::Multiply { path, .. } => vec![path],
            ScalarAction::Move { from, to } | ScalarAction::Copy { from, to } => {
                vec![from, to]
            }
        }
    }

    pub fn map_paths<Q>(self, mut f: impl FnMut(P) -> Q) -> ScalarAction<Q> {
        match self {
            ScalarAction::Set { path, value } => ScalarAction::Set {
                path: f(path),
                value,
            },
            ScalarAction::Delete { path } => ScalarAction::Delete { path: f(path) },
            ScalarAction::InitArray { path } => ScalarAction::InitArray { path: f(path) },
            ScalarAction::InitObject { path } => ScalarAction::InitObject { path: f(path) },
            ScalarAction::InsertBefore { path, value } => ScalarAction::InsertBefore {
                path: f(path),
                value,
            },
            ScalarAction::InsertAfter { path, value } => ScalarAction::InsertAfter {
                path: f(path),
                value,
            },
            ScalarAction::InsertUnique { path, value } => ScalarAction::InsertUnique {
                path: f(path),
                value,
            },
            ScalarAction::Move { from, to } => ScalarAction::Move {
                from: f(from),
                to: f(to),
            },
            ScalarAction::Copy { from, to } => ScalarAction::Copy {
                from: f(from),
                to: f(to),
            },
            ScalarAction::Add { path, amount } => ScalarAction::Add {
                path: f(path),
                amount,
            },
            ScalarAction::Multiply { path, factor } => ScalarAction::Multiply {
                path: f(path),
                factor,
            },
        }
    }
}

/// A scalar edit or an all-or-nothing batch of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action<P> {
    Scalar(ScalarAction<P>),
    Transaction(Vec<ScalarAction<P>>),
}

impl<P> Action<P> {
    /// How many author indices the action consumes.
    pub fn index_width(&self) -> u64 {
        match self {
            Action::Scalar(_) => 1,
            Action::Transaction(actions) => actions.len().max(1) as u64,
        }
    }
}

impl<P> From<ScalarAction<P>> for Action<P> {
    fn from(action: ScalarAction<P>) -> Self {
        Action::Scalar(action)
    }
}

/// An action annotated with its id, as stored in the log. Never mutated once
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: Id,
    pub action: Action<PathRef>,
}

/// A primitive mutation emitted by the action compiler and applied to the
/// live overlay with the op's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Put { path: BinaryPath, value: JsonValue },
    Delete { path: BinaryPath },
    /// Identity-only update: the op takes co-ownership of the path without
    /// changing its value.
    Touch { path: BinaryPath },
    Move { from: BinaryPath, to: BinaryPath },
}

impl Change {
    /// Paths a subscriber watching for this change would care about.
    pub fn touched_paths(&self) -> impl Iterator<Item = &BinaryPath> {
        let (first, second) = match self {
            Change::Put { path, .. } | Change::Delete { path } | Change::Touch { path } => {
                (path, None)
            }
            Change::Move { from, to } => (from, Some(to)),
        };
        std::iter::once(first).chain(second)
    }
}

/// Applies one change to an overlay, attributing it to `id` when present.
pub fn apply_change(
    arena: &mut OverlayArena,
    node: OverlayId,
    change: &Change,
    id: Option<Id>,
) -> OsmosisResult<()> {
    match change {
        Change::Put { path, value } => arena.set_by_path(node, path, value, id),
        Change::Delete { path } => arena.delete_by_path(node, path).map(|_| ()),
        Change::Touch { path } => {
            if let Some(id) = id {
                arena.add_id_to_path(node, path, id);
            }
            Ok(())
        }
        Change::Move { from, to } => {
            arena.move_subtree(node, from, to)?;
            if let Some(id) = id {
                arena.add_id_to_path(node, to, id);
            }
            Ok(())
        }
    }
}
