//! The op log with causal ordering, rewind, and the save-point ladder.
//! [SaveStateCore] holds the shared machinery; [MemorySaveState] keeps
//! everything in memory, the flat-file backend lives in its own crate and
//! wraps the same core.

mod core;
mod memory;

pub use self::core::{SaveStateCore, MIN_SAVE_POINT_WIDTH};
pub use memory::MemorySaveState;

use fxhash::FxHashMap;
use osmosis_common::{AuthorId, Failure, Id, JsonValue, OsmosisResult, StateHash};

use crate::action::{Change, Op};
use crate::json_source::{OverlayId, SourceRef};

/// A checkpoint of the document state after applying every op with
/// `id <= self.id`. `width` is the merge weight of the ladder; `overlay` is
/// the frozen layer holding exactly the writes since the previous
/// save-point.
#[derive(Debug, Clone)]
pub struct SavePoint {
    pub id: Id,
    pub width: u64,
    pub hash: StateHash,
    pub latest_indexes: FxHashMap<AuthorId, u64>,
    pub overlay: OverlayId,
}

/// Cheap convergence check: equal hashes mean equal op logs.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSummary {
    pub hash: StateHash,
    pub latest_indexes: FxHashMap<AuthorId, u64>,
}

/// What one `insert` batch did: every change applied (new ops plus any
/// re-applied tail after a rewind) and the failures recorded along the way.
#[derive(Debug, Default, Clone)]
pub struct InsertResult {
    pub changes: Vec<Change>,
    pub failures: Vec<Failure>,
}

/// The persistence contract the [crate::Store] dispatches through.
///
/// The log never refuses an op it has causal room for: inserting an op older
/// than the tail rewinds, then replays the tail interleaved with the new ops
/// in id order, so every peer ends up with the same log regardless of
/// arrival order.
pub trait SaveState {
    fn insert(&mut self, ops: Vec<Op>) -> OsmosisResult<InsertResult>;

    /// Sorted slice of the log, inclusive bounds.
    fn ops_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Op>;

    /// Sorted slice of the failure log, inclusive bounds.
    fn failures_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Failure>;

    /// Resets to the state as of `id` and returns the dropped tail (every op
    /// with a greater id). Fails when no save-point at or below `id`
    /// survives.
    fn rewind(&mut self, id: Id) -> OsmosisResult<Vec<Op>>;

    fn save_points(&self) -> &[SavePoint];

    /// Opaque peer-supplied blob (the flat-file backend keeps the peer's
    /// identity here).
    fn metadata(&self) -> Option<&JsonValue>;

    fn set_metadata(&mut self, metadata: JsonValue) -> OsmosisResult<()>;

    /// Runs `init` and stores its result iff no metadata has been set yet;
    /// returns the metadata either way.
    fn init_metadata(
        &mut self,
        init: &mut dyn FnMut() -> JsonValue,
    ) -> OsmosisResult<&JsonValue>;

    fn state_summary(&self) -> StateSummary;

    /// Drops ops, failures and save-points below `id`; the save-point at or
    /// just above `id` becomes the new base.
    fn garbage_collect(&mut self, id: Id) -> OsmosisResult<()>;

    /// Read access to the live document state.
    fn source(&self) -> SourceRef<'_>;
}
