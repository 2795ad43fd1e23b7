//! The decomposed JSON tree. A document is stored as a sorted map from
//! [BinaryPath] to [JsonNode]: scalars live directly at their path, arrays
//! and objects are structural markers whose children live at child paths.
//! Two side indexes track which op ids own which paths.

mod overlay;

pub use overlay::{OverlayArena, OverlayContent, OverlayId, SourceRef};

use enum_as_inner::EnumAsInner;
use osmosis_common::{BinaryPath, Id, JsonValue};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Ids owning a path. Usually one, occasionally a handful after touches.
pub type IdSet = SmallVec<[Id; 2]>;

/// What a path resolves to. `Scalar` never holds a list or map; composite
/// values decompose into a marker plus child paths, so a range scan keyed by
/// a path prefix covers exactly one subtree.
#[derive(Debug, Clone, PartialEq, EnumAsInner, Serialize, Deserialize)]
pub enum JsonNode {
    Scalar(JsonValue),
    Array { len: u32 },
    Object { keys: Vec<String> },
}

impl JsonNode {
    pub fn empty_object() -> JsonNode {
        JsonNode::Object { keys: Vec::new() }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JsonNode::Scalar(v) => v.type_name(),
            JsonNode::Array { .. } => "array",
            JsonNode::Object { .. } => "object",
        }
    }
}

/// Read access to a decomposed JSON tree.
pub trait JsonSource {
    /// Resolves a path. Tombstoned or absent paths return `None`; the root
    /// always resolves (defaulting to an empty object).
    fn get_by_path(&self, path: &BinaryPath) -> Option<JsonNode>;

    /// Current path of an op id, `None` when the id was never seen or its
    /// subtree was deleted.
    fn get_path_by_id(&self, id: Id) -> Option<BinaryPath>;

    /// Ids currently owning a path.
    fn get_ids_by_path(&self, path: &BinaryPath) -> IdSet;

    /// Forward scan of live ids strictly after `id`, in id order.
    fn get_ids_after(&self, id: Id) -> Vec<(Id, BinaryPath)>;

    fn get_by_id(&self, id: Id) -> Option<JsonNode> {
        self.get_path_by_id(id)
            .and_then(|path| self.get_by_path(&path))
    }

    /// Reassembles the full JSON value rooted at `path`, recursing through
    /// structural markers. Children an array marker promises but the map
    /// lacks read as `null`.
    fn materialize(&self, path: &BinaryPath) -> Option<JsonValue> {
        let node = self.get_by_path(path)?;
        Some(match node {
            JsonNode::Scalar(value) => value,
            JsonNode::Array { len } => JsonValue::List(
                (0..len)
                    .map(|i| self.materialize(&path.append(i)).unwrap_or_default())
                    .collect(),
            ),
            JsonNode::Object { keys } => JsonValue::Map(
                keys.iter()
                    .map(|key| {
                        let child = self.materialize(&path.append(key.as_str()));
                        (key.clone(), child.unwrap_or_default())
                    })
                    .collect(),
            ),
        })
    }
}
