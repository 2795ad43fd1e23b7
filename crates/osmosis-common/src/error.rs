use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Id;

pub type OsmosisResult<T> = Result<T, StoreError>;

/// Fatal errors. These unwind the current operation; they are never recorded
/// in the failure log (see [Failure] for the recoverable tier).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Malformed binary path")]
    MalformedPath,
    #[error("Malformed op: {0}")]
    MalformedOp(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Invalid JSONPath: {0}")]
    InvalidJsonPath(String),
    #[error("Cannot rewind to {0}: no save point at or below that id")]
    RewindPastOldestSavePoint(Id),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What went wrong with one sub-action. Failures accumulate per op and never
/// abort a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FailureKind {
    #[error("path does not exist")]
    PathDoesNotExist,
    #[error("value is not a number")]
    NotANumber,
    #[error("cannot set the document root")]
    CannotSetRoot,
    #[error("cannot move the document root")]
    CannotMoveRoot,
    #[error("cannot copy the document root")]
    CannotCopyRoot,
    #[error("slice step cannot be 0")]
    SliceStepZero,
    #[error("JSONPath expression error")]
    Expression,
    #[error("value is not an array")]
    NotAnArray,
    #[error("value is not an object")]
    NotAnObject,
    #[error("more than one source/destination path")]
    MoreThanOnePath,
    #[error("malformed op")]
    MalformedOp,
    #[error("persistence failure")]
    Persistence,
}

/// A recoverable, per-operation failure record. `id` is the originating op
/// once the failure is attached to the log; failures produced while
/// compiling a local dispatch carry `None` until ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub id: Option<Id>,
    pub kind: FailureKind,
    pub path: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, path: Option<String>, message: impl Into<String>) -> Self {
        Failure {
            id: None,
            kind,
            path,
            message: message.into(),
        }
    }

    pub fn at(kind: FailureKind, path: impl ToString) -> Self {
        Failure {
            id: None,
            kind,
            path: Some(path.to_string()),
            message: kind.to_string(),
        }
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} at {}: {}", self.kind, path, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Aggregate error for dispatchers that prefer `Err` over inspecting the
/// failure list in the result.
#[derive(Error, Debug)]
#[error("dispatch produced {} failure(s): {}", .failures.len(), summarize(.failures))]
pub struct OsmosisFailureError {
    pub failures: Vec<Failure>,
}

fn summarize(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
