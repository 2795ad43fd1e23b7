//! Flat-file [SaveState] backend. One directory holds the whole store:
//!
//! - `osmosis-metadata.msgpack` — the peer-supplied metadata blob,
//! - `osmosis-recent.msgpack` — ops, failures and overlay since the newest
//!   save-point,
//! - `savepoint-<hex64>.msgpack` — one file per rung of the save-point
//!   ladder, named by the BLAKE2b-256 of the save-point id.
//!
//! The document itself stays in memory; every mutation re-enqueues the
//! affected files on per-file [FileWriter] workers, so the synchronous
//! [SaveState] calls never block on I/O. A newer snapshot of a file
//! supersedes one still waiting to be written. Must run inside a tokio
//! runtime.

mod file_writer;
mod format;

pub use file_writer::FileWriter;
pub use format::{RecentFile, SavePointFile};

use std::path::{Path, PathBuf};

use fxhash::FxHashMap;
use osmosis_common::{
    save_point_file_stem, Failure, FailureKind, Id, JsonValue, OsmosisResult, StoreError,
};
use osmosis_store::save_state::{InsertResult, SavePoint, SaveState, StateSummary};
use osmosis_store::{Op, OverlayArena, SaveStateCore, SourceRef};
use tracing::{debug, info};

pub const METADATA_FILE: &str = "osmosis-metadata.msgpack";
pub const RECENT_FILE: &str = "osmosis-recent.msgpack";

fn save_point_file_name(id: Id) -> String {
    format!("savepoint-{}.msgpack", save_point_file_stem(id))
}

/// What a save-point file's content depends on: its id, its ladder width,
/// and which rung precedes it (that fixes the op span it carries and its
/// overlay after merges). When any of these change the file is rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LadderEntry {
    id: Id,
    width: u64,
    prev: Id,
}

fn ladder_entries(save_points: &[SavePoint]) -> Vec<LadderEntry> {
    save_points
        .iter()
        .enumerate()
        .map(|(i, sp)| LadderEntry {
            id: sp.id,
            width: sp.width,
            prev: i
                .checked_sub(1)
                .map(|p| save_points[p].id)
                .unwrap_or(Id::ZERO),
        })
        .collect()
}

/// A [SaveState] persisted to a directory of msgpack files.
pub struct FsSaveState {
    core: SaveStateCore,
    metadata: Option<JsonValue>,
    dir: PathBuf,
    writers: FxHashMap<String, FileWriter>,
    ladder_cache: Vec<LadderEntry>,
}

impl FsSaveState {
    /// Opens (or initializes) a store directory, replaying the persisted
    /// ladder and recent tail into memory. Fails on unreadable or malformed
    /// files.
    pub async fn open(dir: impl AsRef<Path>) -> OsmosisResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let metadata = match tokio::fs::read(dir.join(METADATA_FILE)).await {
            Ok(bytes) => Some(decode::<JsonValue>(&bytes, METADATA_FILE)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut save_point_files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("savepoint-") && name.ends_with(".msgpack") {
                let bytes = tokio::fs::read(entry.path()).await?;
                save_point_files.push(decode::<SavePointFile>(&bytes, &name)?);
            }
        }

        let fresh = save_point_files.is_empty();
        let core = if fresh {
            SaveStateCore::new()
        } else {
            save_point_files.sort_by_key(|sp| sp.id);
            let mut arena = OverlayArena::new();
            let mut save_points = Vec::with_capacity(save_point_files.len());
            let mut ops = Vec::new();
            let mut failures = Vec::new();
            let mut parent = None;
            for file in save_point_files {
                let overlay = arena.import_layer(parent, file.overlay);
                parent = Some(overlay);
                save_points.push(SavePoint {
                    id: file.id,
                    width: file.width,
                    hash: file.hash,
                    latest_indexes: file.latest_indexes.into_iter().collect(),
                    overlay,
                });
                ops.extend(file.ops);
                failures.extend(file.failures);
            }
            let recent = match tokio::fs::read(dir.join(RECENT_FILE)).await {
                Ok(bytes) => decode::<RecentFile>(&bytes, RECENT_FILE)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecentFile::default(),
                Err(e) => return Err(e.into()),
            };
            ops.extend(recent.ops);
            failures.extend(recent.failures);
            SaveStateCore::from_parts(arena, save_points, ops, failures)?
        };

        info!(dir = %dir.display(), ops = core.ops_range(None, None).len(), "opened store directory");
        let mut state = FsSaveState {
            core,
            metadata,
            dir,
            writers: FxHashMap::default(),
            ladder_cache: Vec::new(),
        };
        if fresh {
            // Seed the directory with the base save-point and an empty
            // recent file. A clean reopen rewrites nothing.
            state.sync_ladder()?;
            state.write_recent()?;
        } else {
            state.ladder_cache = ladder_entries(state.core.save_points());
        }
        Ok(state)
    }

    /// Waits until every queued write and delete has hit the disk.
    pub async fn flush(&self) {
        for writer in self.writers.values() {
            writer.flush().await;
        }
    }

    fn writer(&mut self, name: &str) -> &FileWriter {
        let writer = self
            .writers
            .entry(name.to_string())
            .or_insert_with(|| FileWriter::new(self.dir.join(name)));
        // A spent writer means its delete fully executed; a fresh one can
        // recreate the file without racing it.
        if writer.is_closed() {
            *writer = FileWriter::new(self.dir.join(name));
        }
        writer
    }

    fn enqueue(&mut self, name: &str, bytes: Vec<u8>) {
        if !self.writer(name).write(bytes) {
            debug_assert!(false, "writer was respawned, write cannot be refused");
        }
    }

    /// Reconciles save-point files with the in-memory ladder: new or
    /// reshaped rungs are rewritten, vanished rungs deleted.
    fn sync_ladder(&mut self) -> OsmosisResult<()> {
        let current = ladder_entries(self.core.save_points());
        let old = std::mem::replace(&mut self.ladder_cache, current.clone());
        for stale in &old {
            if !current.iter().any(|entry| entry.id == stale.id) {
                let name = save_point_file_name(stale.id);
                debug!(save_point = %stale.id, "dropping save point file");
                // The writer stays in the map: a rewind can re-create the
                // same save-point id, and its write must supersede this
                // delete if it is still pending.
                self.writer(&name).delete();
            }
        }
        // Garbage collection folds older rungs into the new base without
        // touching its (id, width, prev) triple, so a base identity change
        // forces a rewrite of the first rung.
        let base_changed = old.first().map(|e| e.id) != current.first().map(|e| e.id)
            && !old.is_empty();
        for (i, entry) in current.iter().enumerate() {
            if (base_changed && i == 0) || !old.contains(entry) {
                let bytes = self.encode_save_point(i)?;
                self.enqueue(&save_point_file_name(entry.id), bytes);
            }
        }
        Ok(())
    }

    fn encode_save_point(&self, index: usize) -> OsmosisResult<Vec<u8>> {
        let save_points = self.core.save_points();
        let sp = &save_points[index];
        let prev = index
            .checked_sub(1)
            .map(|p| save_points[p].id)
            .unwrap_or(Id::ZERO);
        let mut ops = self.core.ops_range(None, Some(sp.id));
        ops.retain(|op| op.id > prev);
        let mut failures = self.core.failures_range(None, Some(sp.id));
        failures.retain(|f| f.id.is_some_and(|id| id > prev));
        let mut latest_indexes: Vec<_> = sp
            .latest_indexes
            .iter()
            .map(|(author, index)| (*author, *index))
            .collect();
        latest_indexes.sort();
        encode(&SavePointFile {
            id: sp.id,
            width: sp.width,
            hash: sp.hash,
            latest_indexes,
            ops,
            failures,
            overlay: self.core.arena().export_layer(sp.overlay),
        })
    }

    fn write_recent(&mut self) -> OsmosisResult<()> {
        let live = self.core.source().node;
        let bytes = encode(&RecentFile {
            ops: self.core.recent_ops().to_vec(),
            failures: self.core.recent_failures(),
            overlay: self.core.arena().export_layer(live),
        })?;
        self.enqueue(RECENT_FILE, bytes);
        Ok(())
    }

    fn write_metadata(&mut self) -> OsmosisResult<()> {
        let Some(metadata) = &self.metadata else {
            return Ok(());
        };
        let bytes = encode(metadata)?;
        self.enqueue(METADATA_FILE, bytes);
        Ok(())
    }

    fn after_log_mutation(&mut self) -> OsmosisResult<()> {
        self.sync_ladder()?;
        self.write_recent()
    }

    /// Background write errors (retries exhausted) surfaced as recoverable
    /// failures on the operation that observes them.
    fn drain_persistence_failures(&self) -> Vec<Failure> {
        self.writers
            .values()
            .flat_map(|writer| {
                let path = writer.path().display().to_string();
                writer
                    .take_errors()
                    .into_iter()
                    .map(move |error| {
                        Failure::new(FailureKind::Persistence, Some(path.clone()), error)
                    })
            })
            .collect()
    }
}

impl SaveState for FsSaveState {
    fn insert(&mut self, ops: Vec<Op>) -> OsmosisResult<InsertResult> {
        let mut result = self.core.insert(ops)?;
        self.after_log_mutation()?;
        result.failures.extend(self.drain_persistence_failures());
        Ok(result)
    }

    fn ops_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Op> {
        self.core.ops_range(lo, hi)
    }

    fn failures_range(&self, lo: Option<Id>, hi: Option<Id>) -> Vec<Failure> {
        self.core.failures_range(lo, hi)
    }

    fn rewind(&mut self, id: Id) -> OsmosisResult<Vec<Op>> {
        let dropped = self.core.rewind(id)?;
        self.after_log_mutation()?;
        Ok(dropped)
    }

    fn save_points(&self) -> &[SavePoint] {
        self.core.save_points()
    }

    fn metadata(&self) -> Option<&JsonValue> {
        self.metadata.as_ref()
    }

    fn set_metadata(&mut self, metadata: JsonValue) -> OsmosisResult<()> {
        self.metadata = Some(metadata);
        self.write_metadata()
    }

    fn init_metadata(
        &mut self,
        init: &mut dyn FnMut() -> JsonValue,
    ) -> OsmosisResult<&JsonValue> {
        if self.metadata.is_none() {
            self.metadata = Some(init());
            self.write_metadata()?;
        }
        Ok(self.metadata.as_ref().expect("metadata just initialized"))
    }

    fn state_summary(&self) -> StateSummary {
        self.core.state_summary()
    }

    fn garbage_collect(&mut self, id: Id) -> OsmosisResult<()> {
        self.core.garbage_collect(id)?;
        self.after_log_mutation()
    }

    fn source(&self) -> SourceRef<'_> {
        self.core.source()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> OsmosisResult<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| StoreError::Persistence(e.to_string()))
}

fn decode<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8], name: &str) -> OsmosisResult<T> {
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Decode(format!("{name}: {e}")))
}
