//! JSONPath compiler and query engine. A path string compiles to a list of
//! [Segment]s; evaluation against a [JsonSource] partitions results into
//! paths that exist, paths that could be written, and failures. Concrete
//! paths can additionally be anchored to an op id so they keep pointing at
//! the same node when siblings reshuffle.

mod eval;
mod expr;
mod parser;

pub use eval::{query_paths, query_paths_from, QueryResult};
pub use expr::{BinaryOp, PathExpr, UnaryOp};
pub use parser::{interpolate, parse};

use itertools::Itertools;
use osmosis_common::{BinaryPath, Id, PathIndex, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::json_source::JsonSource;

#[derive(Error, Debug, PartialEq)]
pub enum JsonPathError {
    #[error("Invalid JSONPath: {0}")]
    InvalidJsonPath(String),
    #[error("JSONPath evaluation error: {0}")]
    EvaluationError(String),
}

impl From<JsonPathError> for StoreError {
    fn from(e: JsonPathError) -> Self {
        StoreError::InvalidJsonPath(e.to_string())
    }
}

/// One step of a compiled path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    /// All children.
    Wildcard,
    Key(String),
    /// May be negative until normalized against the array length.
    Index(i64),
    MultiKey(Vec<String>),
    MultiIndex(Vec<i64>),
    /// Each expression evaluates to a subscript (number or string).
    ExprIndex(Vec<PathExpr>),
    Slice {
        from: Option<i64>,
        to: Option<i64>,
        step: Option<i64>,
    },
    ExprSlice {
        from: Option<PathExpr>,
        to: Option<PathExpr>,
        step: Option<PathExpr>,
    },
    /// Include a child iff the expression is truthy on it.
    Filter(PathExpr),
    /// Match the inner segments here and at every descendant.
    Recursive(Vec<Segment>),
}

impl Segment {
    /// True when the segment can match more than one concrete index, which
    /// makes it "variable intent" for the conservative change-matching test.
    fn is_variable(&self) -> bool {
        match self {
            Segment::Key(_) => false,
            Segment::Index(i) => *i < 0,
            Segment::MultiIndex(indices) => indices.iter().any(|i| *i < 0),
            Segment::MultiKey(_) => false,
            _ => true,
        }
    }
}

impl From<PathIndex> for Segment {
    fn from(index: PathIndex) -> Self {
        match index {
            PathIndex::Int(i) => Segment::Index(i as i64),
            PathIndex::Key(k) => Segment::Key(k),
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Wildcard => f.write_str("[*]"),
            Segment::Key(k) => write!(f, "['{k}']"),
            Segment::Index(i) => write!(f, "[{i}]"),
            Segment::MultiKey(keys) => {
                write!(f, "[{}]", keys.iter().map(|k| format!("'{k}'")).join(", "))
            }
            Segment::MultiIndex(indices) => {
                write!(f, "[{}]", indices.iter().map(|i| i.to_string()).join(", "))
            }
            Segment::ExprIndex(exprs) => {
                write!(f, "[{}]", exprs.iter().map(|e| format!("({e})")).join(", "))
            }
            Segment::Slice { from, to, step } => {
                let part = |v: &Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
                write!(f, "[{}:{}:{}]", part(from), part(to), part(step))
            }
            Segment::ExprSlice { from, to, step } => {
                let part =
                    |v: &Option<PathExpr>| v.as_ref().map(|e| format!("({e})")).unwrap_or_default();
                write!(f, "[{}:{}:{}]", part(from), part(to), part(step))
            }
            Segment::Filter(expr) => write!(f, "[?({expr})]"),
            Segment::Recursive(inner) => {
                write!(f, "..{}", inner.iter().map(|s| s.to_string()).join(""))
            }
        }
    }
}

/// A parsed JSONPath, absolute from the document root.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompiledJsonPath(pub Vec<Segment>);

impl std::fmt::Display for CompiledJsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// A compiled path whose prefix is pinned to an op id. Resolution prefers
/// the id's current location and falls back to the recorded concrete path
/// when the id is unknown or tombstoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledJsonIdPath {
    pub id: Id,
    pub fallback: BinaryPath,
    pub suffix: Vec<Segment>,
}

impl std::fmt::Display for CompiledJsonIdPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fallback)?;
        for segment in &self.suffix {
            write!(f, "{segment}")?;
        }
        write!(f, " (anchored to {})", self.id)
    }
}

impl CompiledJsonIdPath {
    /// Concrete base path plus remaining segments, ready for evaluation.
    pub fn resolve(&self, source: &impl JsonSource) -> (BinaryPath, Vec<Segment>) {
        let base = source
            .get_path_by_id(self.id)
            .unwrap_or_else(|| self.fallback.clone());
        (base, self.suffix.clone())
    }
}

/// Pins a concrete path to the deepest prefix that carries at least one op
/// id. Returns the path unchanged (as segments) when no prefix is owned.
/// Idempotent: anchoring a resolved anchor picks the same prefix.
pub fn anchor(
    source: &impl JsonSource,
    path: &BinaryPath,
) -> Result<Option<CompiledJsonIdPath>, StoreError> {
    let indices = path.decode()?;
    let mut prefix = path.clone();
    let mut suffix = Vec::new();
    for index in indices.into_iter().rev() {
        let ids = source.get_ids_by_path(&prefix);
        if let Some(id) = ids.first() {
            return Ok(Some(CompiledJsonIdPath {
                id: *id,
                fallback: prefix,
                suffix,
            }));
        }
        suffix.insert(0, Segment::from(index));
        prefix = prefix.parent()?.expect("non-root while indices remain");
    }
    Ok(None)
}

/// Conservative test of whether a path expression could select `path` or an
/// ancestor/descendant of it. Segments with variable intent match any index.
/// Used to decide which subscriptions a batch of changes might affect; false
/// negatives are not allowed, false positives only cost a re-evaluation.
pub fn could_match(compiled: &CompiledJsonPath, path: &BinaryPath) -> bool {
    let Ok(indices) = path.decode() else {
        return true;
    };
    let mut segments = compiled.0.iter();
    for index in &indices {
        let Some(segment) = segments.next() else {
            // The change is below everything the expression selects.
            return true;
        };
        if matches!(segment, Segment::Recursive(_)) {
            // A recursive segment can swallow any number of indices.
            return true;
        }
        let matches = match segment {
            Segment::Key(k) => matches!(index, PathIndex::Key(other) if other == k),
            Segment::Index(i) => {
                *i < 0 || matches!(index, PathIndex::Int(other) if *other as i64 == *i)
            }
            Segment::MultiKey(keys) => {
                matches!(index, PathIndex::Key(other) if keys.contains(other))
            }
            Segment::MultiIndex(is) => {
                is.iter().any(|i| *i < 0)
                    || matches!(index, PathIndex::Int(other) if is.contains(&(*other as i64)))
            }
            _ if segment.is_variable() => true,
            _ => false,
        };
        if !matches {
            return false;
        }
    }
    // The change sits on or above the selected subtree.
    true
}
