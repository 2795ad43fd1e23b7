use itertools::Itertools;
use osmosis_common::{BinaryPath, Id, JsonValue, OsmosisResult, PathIndex, StoreError};
use serde::{Deserialize, Serialize};
use std::ops::Bound;

use super::{IdSet, JsonNode, JsonSource};
use crate::sorted_map::SortedMap;

/// Handle to one overlay in an [OverlayArena].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OverlayId(usize);

/// One copy-on-write layer. An entry in `values` is authoritative for its
/// path: `Some` is a live node, `None` a tombstone shadowing the parent. An
/// `ids` entry (possibly empty) likewise shadows; `id_paths` maps an id to
/// its current path, `None` once the id's subtree was deleted.
#[derive(Debug, Clone, Default)]
struct OverlayNode {
    parent: Option<OverlayId>,
    values: SortedMap<BinaryPath, Option<JsonNode>>,
    ids: SortedMap<BinaryPath, IdSet>,
    id_paths: SortedMap<Id, Option<BinaryPath>>,
}

/// Serialized form of one overlay, as stored in save-point files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayContent {
    pub values: Vec<(BinaryPath, Option<JsonNode>)>,
    pub ids: Vec<(BinaryPath, Vec<Id>)>,
    pub id_paths: Vec<(Id, Option<BinaryPath>)>,
}

/// Owns every overlay of a save state: the base snapshot, one frozen overlay
/// per save point, and the live overlay, linked child→parent by index so
/// merging a layer is an in-place fold and reparenting flips one index.
#[derive(Debug, Clone, Default)]
pub struct OverlayArena {
    nodes: Vec<Option<OverlayNode>>,
    free: Vec<usize>,
}

/// Borrowed read view of one overlay chain, the `JsonSource` the query
/// engine and action compiler run against.
#[derive(Clone, Copy)]
pub struct SourceRef<'a> {
    pub arena: &'a OverlayArena,
    pub node: OverlayId,
}

impl OverlayArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a parentless overlay (a base snapshot).
    pub fn new_base(&mut self) -> OverlayId {
        self.alloc(OverlayNode::default())
    }

    /// Creates an overlay shadowing `parent`.
    pub fn new_child(&mut self, parent: OverlayId) -> OverlayId {
        self.alloc(OverlayNode {
            parent: Some(parent),
            ..Default::default()
        })
    }

    pub fn parent_of(&self, node: OverlayId) -> Option<OverlayId> {
        self.node(node).parent
    }

    pub fn free(&mut self, node: OverlayId) {
        debug_assert!(self.nodes[node.0].is_some());
        self.nodes[node.0] = None;
        self.free.push(node.0);
    }

    pub fn source(&self, node: OverlayId) -> SourceRef<'_> {
        SourceRef { arena: self, node }
    }

    fn alloc(&mut self, overlay: OverlayNode) -> OverlayId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(overlay);
                OverlayId(slot)
            }
            None => {
                self.nodes.push(Some(overlay));
                OverlayId(self.nodes.len() - 1)
            }
        }
    }

    fn node(&self, id: OverlayId) -> &OverlayNode {
        self.nodes[id.0].as_ref().expect("overlay already freed")
    }

    fn node_mut(&mut self, id: OverlayId) -> &mut OverlayNode {
        self.nodes[id.0].as_mut().expect("overlay already freed")
    }

    fn chain(&self, node: OverlayId) -> impl Iterator<Item = &OverlayNode> {
        let mut next = Some(node);
        std::iter::from_fn(move || {
            let overlay = self.node(next?);
            next = overlay.parent;
            Some(overlay)
        })
    }

    // ---- reads -------------------------------------------------------

    pub fn get_by_path(&self, node: OverlayId, path: &BinaryPath) -> Option<JsonNode> {
        for layer in self.chain(node) {
            if let Some(entry) = layer.values.get(path) {
                return entry.clone();
            }
        }
        // The root always resolves; an untouched document is an empty object.
        if path.is_root() {
            return Some(JsonNode::empty_object());
        }
        None
    }

    pub fn get_ids_by_path(&self, node: OverlayId, path: &BinaryPath) -> IdSet {
        for layer in self.chain(node) {
            if let Some(entry) = layer.ids.get(path) {
                return entry.clone();
            }
        }
        IdSet::new()
    }

    pub fn get_path_by_id(&self, node: OverlayId, id: Id) -> Option<BinaryPath> {
        for layer in self.chain(node) {
            if let Some(entry) = layer.id_paths.get(&id) {
                return entry.clone();
            }
        }
        None
    }

    pub fn get_ids_after(&self, node: OverlayId, id: Id) -> Vec<(Id, BinaryPath)> {
        let layers: Vec<&OverlayNode> = self.chain(node).collect();
        layers
            .iter()
            .enumerate()
            .map(|(depth, layer)| {
                layer
                    .id_paths
                    .range(Bound::Excluded(id), Bound::Unbounded)
                    .map(move |(entry_id, path)| (*entry_id, depth, path))
            })
            .kmerge_by(|a, b| (a.0, a.1) < (b.0, b.1))
            .dedup_by(|a, b| a.0 == b.0)
            .filter_map(|(entry_id, _, path)| path.clone().map(|p| (entry_id, p)))
            .collect()
    }

    // ---- writes ------------------------------------------------------

    /// Writes `value` at `path`, decomposing composites into child paths.
    /// Whatever subtree lived there before is cleared first (its ids are
    /// unlinked recursively); ids already owning `path` itself stay. The
    /// parent marker is updated: a fresh object key is appended, an array
    /// written at exactly its length grows by one.
    pub fn set_by_path(
        &mut self,
        node: OverlayId,
        path: &BinaryPath,
        value: &JsonValue,
        id: Option<Id>,
    ) -> OsmosisResult<()> {
        if !path.is_root() {
            self.link_into_parent(node, path)?;
        }
        self.clear_children(node, path);
        self.write_decomposed(node, path, value);
        if let Some(id) = id {
            self.add_id_to_path(node, path, id);
        }
        Ok(())
    }

    /// Removes the subtree at `path`. Children go first; every id under the
    /// subtree is unlinked (its `id_paths` entry nulled). With a parent
    /// layer present the entries become tombstones, otherwise they are
    /// dropped outright. The parent marker forgets the child (an array only
    /// shrinks when its last index is deleted; interior deletions are
    /// compacted by the action compiler before ever reaching here).
    pub fn delete_by_path(
        &mut self,
        node: OverlayId,
        path: &BinaryPath,
    ) -> OsmosisResult<Option<JsonNode>> {
        if path.is_root() {
            return Err(StoreError::MalformedOp("cannot delete the root".into()));
        }
        let Some(existing) = self.get_by_path(node, path) else {
            return Ok(None);
        };
        self.clear_children(node, path);
        self.unlink_ids_at(node, path);
        self.remove_value_entry(node, path);

        let (parent, last) = path.split()?.expect("non-root path has a parent");
        if let Some(marker) = self.get_by_path(node, &parent) {
            match (marker, last) {
                (JsonNode::Object { mut keys }, PathIndex::Key(key)) => {
                    keys.retain(|k| *k != key);
                    self.write_value_entry(node, &parent, JsonNode::Object { keys });
                }
                (JsonNode::Array { len }, PathIndex::Int(i)) if i + 1 == len => {
                    self.write_value_entry(node, &parent, JsonNode::Array { len: len - 1 });
                }
                _ => {}
            }
        }
        Ok(Some(existing))
    }

    /// Adds `id` to the owners of `path` and points the id index at it.
    pub fn add_id_to_path(&mut self, node: OverlayId, path: &BinaryPath, id: Id) {
        let mut ids = self.get_ids_by_path(node, path);
        if !ids.contains(&id) {
            ids.push(id);
            ids.sort_unstable();
        }
        self.node_mut(node).ids.insert(path.clone(), ids);
        self.node_mut(node)
            .id_paths
            .insert(id, Some(path.clone()));
    }

    /// Replaces the owner set of `path`, repointing every id at it.
    pub fn set_ids_by_path(&mut self, node: OverlayId, path: &BinaryPath, ids: IdSet) {
        for id in &ids {
            self.node_mut(node).id_paths.insert(*id, Some(path.clone()));
        }
        self.node_mut(node).ids.insert(path.clone(), ids);
    }

    /// Relocates the subtree at `from` to `to`, carrying its ids along and
    /// rewriting their paths. The previous occupant of `to` is cleared, its
    /// ids unlinked. Source entries are removed and the source parent marker
    /// updated under the same last-index rule as deletion, so interior moves
    /// of an array shift leave a hole that the emitting compiler is about to
    /// overwrite or delete.
    pub fn move_subtree(
        &mut self,
        node: OverlayId,
        from: &BinaryPath,
        to: &BinaryPath,
    ) -> OsmosisResult<()> {
        if from.is_root() || to.is_root() {
            return Err(StoreError::MalformedOp("cannot move the root".into()));
        }
        if self.get_by_path(node, from).is_none() {
            return Err(StoreError::MalformedOp(format!(
                "move source {from} does not exist"
            )));
        }
        let mut captured = Vec::new();
        self.capture_subtree(node, from, &BinaryPath::ROOT, &mut captured);

        // Clear the destination before linking, then write the capture.
        if self.get_by_path(node, to).is_some() {
            self.clear_children(node, to);
            self.unlink_ids_at(node, to);
            self.remove_value_entry(node, to);
        }
        self.link_into_parent(node, to)?;
        for (rel, marker, ids) in &captured {
            let dest = to.concat(rel);
            self.write_value_entry(node, &dest, marker.clone());
            if !ids.is_empty() {
                self.set_ids_by_path(node, &dest, ids.clone());
            }
        }

        // Drop the source side: values out, owner sets emptied. Ids were
        // repointed above, so no unlinking here.
        for (rel, _, ids) in &captured {
            let src = from.concat(rel);
            self.remove_value_entry(node, &src);
            if !ids.is_empty() {
                self.node_mut(node).ids.insert(src, IdSet::new());
            }
        }
        let (parent, last) = from.split()?.expect("non-root path has a parent");
        if let Some(marker) = self.get_by_path(node, &parent) {
            match (marker, last) {
                (JsonNode::Object { mut keys }, PathIndex::Key(key)) => {
                    keys.retain(|k| *k != key);
                    self.write_value_entry(node, &parent, JsonNode::Object { keys });
                }
                (JsonNode::Array { len }, PathIndex::Int(i)) if i + 1 == len => {
                    self.write_value_entry(node, &parent, JsonNode::Array { len: len - 1 });
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- layer maintenance ------------------------------------------

    /// Folds the parent layer of `node` into `node`: entries the child
    /// lacks are inherited, the chain then skips to the grandparent and the
    /// parent layer is freed. When the result becomes a base layer its
    /// tombstones are dropped (`id_paths` nulls stay; a deleted id remains
    /// deleted).
    pub fn absorb_parent(&mut self, node: OverlayId) {
        let Some(parent_id) = self.node(node).parent else {
            debug_assert!(false, "absorb_parent on a base overlay");
            return;
        };
        let parent = self.nodes[parent_id.0].take().expect("overlay already freed");
        self.free.push(parent_id.0);

        let child = self.node_mut(node);
        child.parent = parent.parent;
        for (path, entry) in parent.values {
            if !child.values.contains_key(&path) {
                child.values.insert(path, entry);
            }
        }
        for (path, ids) in parent.ids {
            if !child.ids.contains_key(&path) {
                child.ids.insert(path, ids);
            }
        }
        for (id, path) in parent.id_paths {
            if !child.id_paths.contains_key(&id) {
                child.id_paths.insert(id, path);
            }
        }
        if child.parent.is_none() {
            child.values.retain(|_, entry| entry.is_some());
            child.ids.retain(|_, ids| !ids.is_empty());
        }

        // Anything chained below the freed layer follows the survivor.
        for slot in self.nodes.iter_mut().flatten() {
            if slot.parent == Some(parent_id) {
                slot.parent = Some(node);
            }
        }
    }

    /// Snapshot of one layer's own entries (not the merged chain view).
    pub fn export_layer(&self, node: OverlayId) -> OverlayContent {
        let overlay = self.node(node);
        OverlayContent {
            values: overlay
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ids: overlay
                .ids
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect(),
            id_paths: overlay
                .id_paths
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }

    /// Rebuilds a layer from its serialized form, chained onto `parent`.
    pub fn import_layer(&mut self, parent: Option<OverlayId>, content: OverlayContent) -> OverlayId {
        self.alloc(OverlayNode {
            parent,
            values: content.values.into_iter().collect(),
            ids: content
                .ids
                .into_iter()
                .map(|(k, v)| (k, IdSet::from_vec(v)))
                .collect(),
            id_paths: content.id_paths.into_iter().collect(),
        })
    }

    // ---- internals ---------------------------------------------------

    /// Ensures the parent of `path` can hold the child and records it in
    /// the parent's structural marker.
    fn link_into_parent(&mut self, node: OverlayId, path: &BinaryPath) -> OsmosisResult<()> {
        let (parent, last) = path.split()?.expect("non-root path has a parent");
        let marker = self.get_by_path(node, &parent).ok_or_else(|| {
            StoreError::MalformedOp(format!("parent path {parent} does not exist"))
        })?;
        match (marker, last) {
            (JsonNode::Object { mut keys }, PathIndex::Key(key)) => {
                if !keys.contains(&key) {
                    keys.push(key);
                    self.write_value_entry(node, &parent, JsonNode::Object { keys });
                }
            }
            (JsonNode::Array { len }, PathIndex::Int(i)) => {
                if i > len {
                    return Err(StoreError::MalformedOp(format!(
                        "array write at {path} would leave a hole (len {len})"
                    )));
                }
                if i == len {
                    self.write_value_entry(node, &parent, JsonNode::Array { len: len + 1 });
                }
            }
            (marker, _) => {
                return Err(StoreError::MalformedOp(format!(
                    "cannot write a child into a {} at {parent}",
                    marker.type_name()
                )));
            }
        }
        Ok(())
    }

    fn write_decomposed(&mut self, node: OverlayId, path: &BinaryPath, value: &JsonValue) {
        match value {
            JsonValue::List(items) => {
                self.write_value_entry(
                    node,
                    path,
                    JsonNode::Array {
                        len: items.len() as u32,
                    },
                );
                for (i, item) in items.iter().enumerate() {
                    self.write_decomposed(node, &path.append(i as u32), item);
                }
            }
            JsonValue::Map(entries) => {
                self.write_value_entry(
                    node,
                    path,
                    JsonNode::Object {
                        keys: entries.keys().cloned().collect(),
                    },
                );
                for (key, item) in entries {
                    self.write_decomposed(node, &path.append(key.as_str()), item);
                }
            }
            scalar => self.write_value_entry(node, path, JsonNode::Scalar(scalar.clone())),
        }
    }

    /// Clears every descendant of `path` (not `path` itself), unlinking
    /// their ids. Walks structural markers rather than map ranges so the
    /// traversal matches exactly what the document promises.
    fn clear_children(&mut self, node: OverlayId, path: &BinaryPath) {
        let children: Vec<BinaryPath> = match self.get_by_path(node, path) {
            Some(JsonNode::Array { len }) => (0..len).map(|i| path.append(i)).collect(),
            Some(JsonNode::Object { keys }) => {
                keys.iter().map(|k| path.append(k.as_str())).collect()
            }
            _ => return,
        };
        for child in children {
            self.clear_children(node, &child);
            self.unlink_ids_at(node, &child);
            self.remove_value_entry(node, &child);
        }
    }

    /// Nulls the id index for every owner of `path` and empties the owner
    /// set.
    fn unlink_ids_at(&mut self, node: OverlayId, path: &BinaryPath) {
        let ids = self.get_ids_by_path(node, path);
        let overlay = self.node_mut(node);
        for id in &ids {
            overlay.id_paths.insert(*id, None);
        }
        if !ids.is_empty() || overlay.ids.contains_key(path) {
            overlay.ids.insert(path.clone(), IdSet::new());
        }
    }

    fn write_value_entry(&mut self, node: OverlayId, path: &BinaryPath, value: JsonNode) {
        self.node_mut(node).values.insert(path.clone(), Some(value));
    }

    /// Tombstones `path` when a parent layer exists, removes it outright in
    /// a base layer.
    fn remove_value_entry(&mut self, node: OverlayId, path: &BinaryPath) {
        let has_parent = self.node(node).parent.is_some();
        let overlay = self.node_mut(node);
        if has_parent {
            overlay.values.insert(path.clone(), None);
        } else {
            overlay.values.remove(path);
        }
    }

    fn capture_subtree(
        &self,
        node: OverlayId,
        path: &BinaryPath,
        rel: &BinaryPath,
        out: &mut Vec<(BinaryPath, JsonNode, IdSet)>,
    ) {
        let Some(marker) = self.get_by_path(node, path) else {
            return;
        };
        out.push((
            rel.clone(),
            marker.clone(),
            self.get_ids_by_path(node, path),
        ));
        match marker {
            JsonNode::Array { len } => {
                for i in 0..len {
                    self.capture_subtree(node, &path.append(i), &rel.append(i), out);
                }
            }
            JsonNode::Object { keys } => {
                for key in &keys {
                    self.capture_subtree(
                        node,
                        &path.append(key.as_str()),
                        &rel.append(key.as_str()),
                        out,
                    );
                }
            }
            JsonNode::Scalar(_) => {}
        }
    }
}

impl JsonSource for SourceRef<'_> {
    fn get_by_path(&self, path: &BinaryPath) -> Option<JsonNode> {
        self.arena.get_by_path(self.node, path)
    }

    fn get_path_by_id(&self, id: Id) -> Option<BinaryPath> {
        self.arena.get_path_by_id(self.node, id)
    }

    fn get_ids_by_path(&self, path: &BinaryPath) -> IdSet {
        self.arena.get_ids_by_path(self.node, path)
    }

    fn get_ids_after(&self, id: Id) -> Vec<(Id, BinaryPath)> {
        self.arena.get_ids_after(self.node, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmosis_common::AuthorId;
    use serde_json::json;

    fn value(v: serde_json::Value) -> JsonValue {
        v.into()
    }

    fn id(n: u64) -> Id {
        Id::new(AuthorId::from_bytes([7; 16]), n)
    }

    fn root_key(key: &str) -> BinaryPath {
        BinaryPath::ROOT.append(key)
    }

    #[test]
    fn set_decomposes_and_materializes() {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(
                base,
                &root_key("doc"),
                &value(json!({"a": [1, {"b": true}], "c": "x"})),
                Some(id(1)),
            )
            .unwrap();
        let path = root_key("doc").append("a").append(1u32).append("b");
        assert_eq!(
            arena.get_by_path(base, &path),
            Some(JsonNode::Scalar(JsonValue::Bool(true)))
        );
        assert_eq!(
            arena.source(base).materialize(&root_key("doc")),
            Some(value(json!({"a": [1, {"b": true}], "c": "x"})))
        );
        // Root marker picked up the new key.
        assert_eq!(
            arena.get_by_path(base, &BinaryPath::ROOT),
            Some(JsonNode::Object {
                keys: vec!["doc".to_string()]
            })
        );
        assert_eq!(arena.get_path_by_id(base, id(1)), Some(root_key("doc")));
    }

    #[test]
    fn overwrite_unlinks_descendant_ids() {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(base, &root_key("doc"), &value(json!({"a": 1})), Some(id(1)))
            .unwrap();
        arena
            .set_by_path(base, &root_key("doc").append("a"), &value(json!(2)), Some(id(2)))
            .unwrap();
        arena
            .set_by_path(base, &root_key("doc"), &value(json!("flat")), Some(id(3)))
            .unwrap();
        assert_eq!(arena.get_path_by_id(base, id(2)), None);
        // Prior owners of the overwritten path itself survive.
        assert_eq!(arena.get_path_by_id(base, id(1)), Some(root_key("doc")));
        let owners = arena.get_ids_by_path(base, &root_key("doc"));
        assert!(owners.contains(&id(1)) && owners.contains(&id(3)));
    }

    #[test]
    fn delete_recursively_unlinks() {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(base, &root_key("doc"), &value(json!({"a": {"b": 1}})), Some(id(1)))
            .unwrap();
        let inner = root_key("doc").append("a").append("b");
        arena.set_by_path(base, &inner, &value(json!(5)), Some(id(2))).unwrap();
        arena.delete_by_path(base, &root_key("doc")).unwrap();
        assert_eq!(arena.get_by_path(base, &root_key("doc")), None);
        assert_eq!(arena.get_path_by_id(base, id(1)), None);
        assert_eq!(arena.get_path_by_id(base, id(2)), None);
        assert_eq!(
            arena.get_by_path(base, &BinaryPath::ROOT),
            Some(JsonNode::empty_object())
        );
    }

    #[test]
    fn overlay_shadows_and_absorbs() {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(base, &root_key("kept"), &value(json!(1)), None)
            .unwrap();
        arena
            .set_by_path(base, &root_key("gone"), &value(json!(2)), None)
            .unwrap();
        let child = arena.new_child(base);
        arena.delete_by_path(child, &root_key("gone")).unwrap();
        arena
            .set_by_path(child, &root_key("new"), &value(json!(3)), None)
            .unwrap();

        assert_eq!(arena.get_by_path(child, &root_key("gone")), None);
        assert_eq!(
            arena.get_by_path(child, &root_key("kept")),
            Some(JsonNode::Scalar(value(json!(1))))
        );
        // Parent is untouched.
        assert!(arena.get_by_path(base, &root_key("gone")).is_some());

        arena.absorb_parent(child);
        assert_eq!(arena.parent_of(child), None);
        assert_eq!(arena.get_by_path(child, &root_key("gone")), None);
        assert_eq!(
            arena.source(child).materialize(&BinaryPath::ROOT),
            Some(value(json!({"kept": 1, "new": 3})))
        );
    }

    #[test]
    fn move_carries_ids() {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(base, &root_key("a"), &value(json!({"x": 1})), Some(id(1)))
            .unwrap();
        arena.add_id_to_path(base, &root_key("a").append("x"), id(2));
        arena.move_subtree(base, &root_key("a"), &root_key("b")).unwrap();

        assert_eq!(arena.get_path_by_id(base, id(1)), Some(root_key("b")));
        assert_eq!(
            arena.get_path_by_id(base, id(2)),
            Some(root_key("b").append("x"))
        );
        assert_eq!(arena.get_by_path(base, &root_key("a")), None);
        assert_eq!(
            arena.source(base).materialize(&root_key("b")),
            Some(value(json!({"x": 1})))
        );
        assert_eq!(
            arena.get_by_path(base, &BinaryPath::ROOT),
            Some(JsonNode::Object {
                keys: vec!["b".to_string()]
            })
        );
    }

    #[test]
    fn ids_after_merges_layers() {
        let mut arena = OverlayArena::new();
        let base = arena.new_base();
        arena
            .set_by_path(base, &root_key("a"), &value(json!(1)), Some(id(1)))
            .unwrap();
        arena
            .set_by_path(base, &root_key("b"), &value(json!(2)), Some(id(3)))
            .unwrap();
        let child = arena.new_child(base);
        arena
            .set_by_path(child, &root_key("c"), &value(json!(3)), Some(id(2)))
            .unwrap();
        arena.delete_by_path(child, &root_key("b")).unwrap();

        let after: Vec<_> = arena.get_ids_after(child, id(0));
        assert_eq!(
            after,
            vec![(id(1), root_key("a")), (id(2), root_key("c"))]
        );
    }
}
