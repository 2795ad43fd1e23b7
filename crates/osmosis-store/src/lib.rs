//! osmosis-store is the core of a replicated JSON document store.
//!
//! A single JSON document is mutated by a stream of causally-ordered ops
//! originating from any number of peers. Peers exchange ops asynchronously;
//! given the same op set, every peer converges to the same JSON value, the
//! same op log, and the same content hash, regardless of receive order.
//!
//! The crate is layered bottom-up: the decomposed JSON tree
//! ([json_source]), the JSONPath compiler and query engine ([jsonpath]),
//! the action→change compiler ([compiler]), the op log with its save-point
//! ladder ([save_state]), and the dispatching [Store] with live query
//! subscriptions on top.

pub mod action;
pub mod compiler;
pub mod json_source;
pub mod jsonpath;
pub mod save_state;
pub mod store;

mod sorted_map;
mod subscription;

pub use action::{apply_change, Action, Change, Op, PathRef, ScalarAction};
pub use compiler::{compile_action, CompiledAction};
pub use json_source::{IdSet, JsonNode, JsonSource, OverlayArena, OverlayContent, OverlayId, SourceRef};
pub use jsonpath::{
    anchor, could_match, interpolate, parse as parse_jsonpath, query_paths, query_paths_from,
    CompiledJsonIdPath, CompiledJsonPath, JsonPathError, PathExpr, QueryResult, Segment,
};
pub use save_state::{
    InsertResult, MemorySaveState, SavePoint, SaveState, SaveStateCore, StateSummary,
    MIN_SAVE_POINT_WIDTH,
};
pub use sorted_map::SortedMap;
pub use store::{DispatchResult, Store, Vars};
pub use subscription::{SubscriberCallback, Subscription};

pub use osmosis_common::{
    AuthorId, BinaryPath, Failure, FailureKind, Id, JsonValue, OsmosisFailureError,
    OsmosisResult, PathIndex, StateHash, StoreError,
};
