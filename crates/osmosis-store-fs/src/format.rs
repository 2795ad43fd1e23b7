use osmosis_common::{AuthorId, Failure, Id, StateHash};
use osmosis_store::{Op, OverlayContent};
use serde::{Deserialize, Serialize};

/// `osmosis-recent.msgpack`: everything since the newest save-point — the
/// tail of the op and failure logs plus the live overlay.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RecentFile {
    pub ops: Vec<Op>,
    pub failures: Vec<Failure>,
    pub overlay: OverlayContent,
}

/// `savepoint-<hex64>.msgpack`: one rung of the ladder. `ops` and
/// `failures` cover exactly the span since the previous save-point, so
/// concatenating the files in id order (plus the recent file) rebuilds the
/// full log. `latest_indexes` is kept sorted for byte-stable output.
#[derive(Debug, Serialize, Deserialize)]
pub struct SavePointFile {
    pub id: Id,
    pub width: u64,
    pub hash: StateHash,
    pub latest_indexes: Vec<(AuthorId, u64)>,
    pub ops: Vec<Op>,
    pub failures: Vec<Failure>,
    pub overlay: OverlayContent,
}
