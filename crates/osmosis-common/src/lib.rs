//! Shared vocabulary of the osmosis replicated JSON store: op ids and the
//! rolling state hash, the binary path codec, the JSON value model, and the
//! two-tier error taxonomy. Everything here is wire-visible and must stay
//! byte-compatible across peers.

mod error;
mod hash;
mod id;
mod path;
mod value;

pub use error::{Failure, FailureKind, OsmosisFailureError, OsmosisResult, StoreError};
pub use hash::{save_point_file_stem, StateHash};
pub use id::{AuthorId, Id};
pub use path::{BinaryPath, PathIndex, PathIter};
pub use value::JsonValue;
