use osmosis_common::{Failure, Id, JsonValue, OsmosisResult};

use super::{InsertResult, SavePoint, SaveState, SaveStateCore, StateSummary};
use crate::action::Op;
use crate::json_source::SourceRef;

/// Everything-in-memory [SaveState]: the default backend for tests and for
/// embedders that persist elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemorySaveState {
    core: SaveStateCore,
    metadata: Option<JsonValue>,
}

impl MemorySaveState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaveState for MemorySaveState {
    fn insert(&mut self, ops: Vec<Op>) -> OsmosisResult<InsertResult> {
        self.core.insert(ops)
    }

    fn ops_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Op> {
        self.core.ops_range(lo, hi)
    }

    fn failures_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Failure> {
        self.core.failures_range(lo, hi)
    }

    fn rewind(&mut self, id: Id) -> OsmosisResult<Vec<Op>> {
        self.core.rewind(id)
    }

    fn save_points(&self) -> &[SavePoint] {
        self.core.save_points()
    }

    fn metadata(&self) -> Option<&JsonValue> {
        self.metadata.as_ref()
    }

    fn set_metadata(&mut self, metadata: JsonValue) -> OsmosisResult<()> {
        self.metadata = Some(metadata);
        Ok(())
    }

    fn init_metadata(
        &mut self,
        init: &mut dyn FnMut() -> JsonValue,
    ) -> OsmosisResult<&JsonValue> {
        if self.metadata.is_none() {
            self.metadata = Some(init());
        }
        Ok(self.metadata.as_ref().expect("metadata just initialized"))
    }

    fn state_summary(&self) -> StateSummary {
        self.core.state_summary()
    }

    fn garbage_collect(&mut self, id: Id) -> OsmosisResult<()> {
        self.core.garbage_collect(id)
    }

    fn source(&self) -> SourceRef<'_> {
        self.core.source()
    }
}
