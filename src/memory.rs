//! In-memory content store
//!
//! Reference `ContentStore` holding the live tree, snapshot frozen
//! copies and version histories in process memory. Checkpoints are
//! content-addressed: checking in an unchanged versionable returns the
//! existing base snapshot instead of a new one.
//!
//! Author: Moroya Sakamoto

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::path;
use crate::resolver::{to_frozen_name, to_real_name};
use crate::store::{
    AttrValue, ContentStore, HistoryId, NodeData, NodeKind, SnapshotInfo, VersionId,
    VersionableId, ATTR_BASE_VERSION, ATTR_CREATED, ATTR_UUID, ATTR_VERSION_HISTORY,
};
use crate::tree::{NodeId, NodeTree, TreeNode};

/// Stored snapshot: metadata plus frozen copy
#[derive(Debug, Clone)]
struct Snapshot {
    id: VersionId,
    history_id: HistoryId,
    versionable_id: VersionableId,
    created: chrono::DateTime<Utc>,
    content_hash: u64,
    tree: NodeTree,
}

/// Ordered snapshots of one versionable
#[derive(Debug, Clone, Default)]
struct History {
    versions: Vec<VersionId>,
    labels: BTreeMap<String, VersionId>,
}

/// In-memory content store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tree: NodeTree,
    snapshots: HashMap<VersionId, Snapshot>,
    histories: HashMap<HistoryId, History>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: NodeTree::new(NodeKind::Folder),
            snapshots: HashMap::new(),
            histories: HashMap::new(),
        }
    }

    /// Number of live nodes including the root
    pub fn node_count(&self) -> usize {
        self.tree.node_count()
    }

    /// Number of stored snapshots
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Snapshot IDs of a history, oldest first
    pub fn versions(&self, history: HistoryId) -> Vec<VersionId> {
        self.histories
            .get(&history)
            .map(|h| h.versions.clone())
            .unwrap_or_default()
    }

    fn lookup(&self, path: &str) -> Option<NodeId> {
        self.tree.find(path)
    }

    fn require_id(&self, path: &str) -> StoreResult<NodeId> {
        self.lookup(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn absolute(rel: &str) -> String {
        format!("/{rel}")
    }

    fn info(&self, snap: &Snapshot) -> SnapshotInfo {
        let labels = self
            .histories
            .get(&snap.history_id)
            .map(|h| {
                h.labels
                    .iter()
                    .filter(|(_, v)| **v == snap.id)
                    .map(|(l, _)| l.clone())
                    .collect()
            })
            .unwrap_or_default();
        SnapshotInfo {
            id: snap.id,
            history_id: snap.history_id,
            versionable_id: snap.versionable_id,
            created: snap.created,
            labels,
            content_hash: snap.content_hash,
        }
    }

    /// Free slot for a new child of `path`: parent ID and child name
    fn vacant(&self, path: &str) -> StoreResult<(NodeId, String)> {
        let parent = path::parent(path)
            .ok_or_else(|| StoreError::Invalid(format!("cannot create {path}")))?;
        let parent_id = self
            .lookup(parent)
            .ok_or_else(|| StoreError::NotFound(parent.to_string()))?;
        let name = path::name(path);
        if name.is_empty() {
            return Err(StoreError::Invalid(format!("empty name in {path}")));
        }
        if self.tree.child_by_name(parent_id, name).is_some() {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        Ok((parent_id, name.to_string()))
    }

    fn freeze(&self, id: NodeId) -> NodeTree {
        let mut frozen = NodeTree::new(NodeKind::Versionable);
        let frozen_root = frozen.root_id();
        if let Some(node) = self.tree.get_node(id) {
            if let Some(root) = frozen.get_node_mut(frozen_root) {
                root.name = node.name.clone();
                root.attributes = frozen_attributes(&node.attributes);
            }
            let mut map = |_: &TreeNode, copy: &mut TreeNode| {
                copy.attributes = frozen_attributes(&copy.attributes);
            };
            for &child in &node.children {
                self.tree
                    .copy_subtree_into(child, &mut frozen, frozen_root, &mut map);
            }
        }
        frozen
    }
}

fn frozen_attributes(attrs: &BTreeMap<String, AttrValue>) -> BTreeMap<String, AttrValue> {
    attrs
        .iter()
        .filter(|(k, _)| k.as_str() != ATTR_BASE_VERSION)
        .map(|(k, v)| (to_frozen_name(k).to_string(), v.clone()))
        .collect()
}

fn thawed_attributes(attrs: &BTreeMap<String, AttrValue>) -> BTreeMap<String, AttrValue> {
    attrs
        .iter()
        .map(|(k, v)| (to_real_name(k).to_string(), v.clone()))
        .collect()
}

impl ContentStore for MemoryStore {
    fn node(&self, path: &str) -> StoreResult<Option<NodeData>> {
        Ok(self
            .lookup(path)
            .and_then(|id| self.tree.get_node(id))
            .map(|n| n.data()))
    }

    fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let id = self.require_id(path)?;
        Ok(self.tree.child_names(id))
    }

    fn set_attribute(
        &mut self,
        path: &str,
        name: &str,
        value: Option<AttrValue>,
    ) -> StoreResult<()> {
        let id = self.require_id(path)?;
        if let Some(node) = self.tree.get_node_mut(id) {
            match value {
                Some(v) => {
                    node.attributes.insert(name.to_string(), v);
                }
                None => {
                    node.attributes.remove(name);
                }
            }
        }
        Ok(())
    }

    fn create_node(&mut self, path: &str, kind: NodeKind) -> StoreResult<()> {
        let (parent_id, name) = self.vacant(path)?;
        let id = self.tree.add_node(kind, &name, parent_id);
        if kind == NodeKind::Versionable {
            let history_id = Uuid::new_v4();
            self.histories.insert(history_id, History::default());
            if let Some(node) = self.tree.get_node_mut(id) {
                node.attributes
                    .insert(ATTR_UUID.to_string(), AttrValue::Id(Uuid::new_v4()));
                node.attributes
                    .insert(ATTR_VERSION_HISTORY.to_string(), AttrValue::Id(history_id));
                node.attributes
                    .insert(ATTR_CREATED.to_string(), AttrValue::Date(Utc::now()));
            }
        }
        Ok(())
    }

    fn move_subtree(&mut self, from: &str, to: &str) -> StoreResult<()> {
        let id = self.require_id(from)?;
        let (parent_id, name) = self.vacant(to)?;
        if self.tree.move_node(id, parent_id, &name) {
            Ok(())
        } else {
            Err(StoreError::Invalid(format!("cannot move {from} into {to}")))
        }
    }

    fn delete_subtree(&mut self, path: &str) -> StoreResult<()> {
        let id = self.require_id(path)?;
        if id == self.tree.root_id() {
            return Err(StoreError::Invalid("cannot delete the root".into()));
        }
        self.tree.remove_subtree(id);
        Ok(())
    }

    fn order_before(
        &mut self,
        parent: &str,
        name: &str,
        before: Option<&str>,
    ) -> StoreResult<()> {
        let parent_id = self.require_id(parent)?;
        let child = self
            .tree
            .child_by_name(parent_id, name)
            .ok_or_else(|| StoreError::NotFound(path::join(parent, name)))?;
        let before = match before {
            Some(b) => Some(
                self.tree
                    .child_by_name(parent_id, b)
                    .ok_or_else(|| StoreError::NotFound(path::join(parent, b)))?,
            ),
            None => None,
        };
        self.tree.order_before(parent_id, child, before);
        Ok(())
    }

    fn checkpoint(&mut self, path: &str) -> StoreResult<SnapshotInfo> {
        let id = self.require_id(path)?;
        let node = self
            .tree
            .get_node(id)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if node.kind != NodeKind::Versionable {
            return Err(StoreError::NotVersionable(path.to_string()));
        }
        let history_id = node
            .attributes
            .get(ATTR_VERSION_HISTORY)
            .and_then(AttrValue::as_id)
            .ok_or_else(|| StoreError::Invalid(format!("{path} has no history")))?;
        let versionable_id = node
            .attributes
            .get(ATTR_UUID)
            .and_then(AttrValue::as_id)
            .ok_or_else(|| StoreError::Invalid(format!("{path} has no identity")))?;
        let base = node.attributes.get(ATTR_BASE_VERSION).and_then(AttrValue::as_id);

        let frozen = self.freeze(id);
        let content_hash = frozen.subtree_hash(frozen.root_id());
        if let Some(existing) = base.and_then(|b| self.snapshots.get(&b)) {
            if existing.content_hash == content_hash {
                return Ok(self.info(existing));
            }
        }

        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            history_id,
            versionable_id,
            created: Utc::now(),
            content_hash,
            tree: frozen,
        };
        let version = snapshot.id;
        let info = self.info(&snapshot);
        self.snapshots.insert(version, snapshot);
        self.histories
            .entry(history_id)
            .or_default()
            .versions
            .push(version);
        self.set_attribute(path, ATTR_BASE_VERSION, Some(AttrValue::Id(version)))?;
        Ok(info)
    }

    fn snapshot(&self, version: VersionId) -> StoreResult<Option<SnapshotInfo>> {
        Ok(self.snapshots.get(&version).map(|s| self.info(s)))
    }

    fn frozen_node(&self, version: VersionId, rel_path: &str) -> StoreResult<Option<NodeData>> {
        let snap = self
            .snapshots
            .get(&version)
            .ok_or_else(|| StoreError::VersionNotFound(version.to_string()))?;
        Ok(snap
            .tree
            .find(rel_path)
            .and_then(|id| snap.tree.get_node(id))
            .map(|n| n.data()))
    }

    fn frozen_children(&self, version: VersionId, rel_path: &str) -> StoreResult<Vec<String>> {
        let snap = self
            .snapshots
            .get(&version)
            .ok_or_else(|| StoreError::VersionNotFound(version.to_string()))?;
        let id = snap
            .tree
            .find(rel_path)
            .ok_or_else(|| StoreError::NotFound(rel_path.to_string()))?;
        Ok(snap.tree.child_names(id))
    }

    fn restore(&mut self, path: &str, version: VersionId) -> StoreResult<()> {
        let (parent_id, name) = self.vacant(path)?;
        let snap = self
            .snapshots
            .get(&version)
            .ok_or_else(|| StoreError::VersionNotFound(version.to_string()))?;
        let frozen_root = snap.tree.root_id();
        let mut map = |_: &TreeNode, copy: &mut TreeNode| {
            copy.attributes = thawed_attributes(&copy.attributes);
        };
        let new_id = snap
            .tree
            .copy_subtree_into(frozen_root, &mut self.tree, parent_id, &mut map)
            .ok_or_else(|| StoreError::Invalid(format!("empty snapshot {version}")))?;
        if let Some(node) = self.tree.get_node_mut(new_id) {
            node.name = name;
            node.attributes
                .insert(ATTR_BASE_VERSION.to_string(), AttrValue::Id(version));
        }
        Ok(())
    }

    fn add_label(&mut self, history: HistoryId, version: VersionId, label: &str) -> StoreResult<()> {
        let belongs = self
            .snapshots
            .get(&version)
            .is_some_and(|s| s.history_id == history);
        if !belongs {
            return Err(StoreError::VersionNotFound(version.to_string()));
        }
        self.histories
            .entry(history)
            .or_default()
            .labels
            .insert(label.to_string(), version);
        Ok(())
    }

    fn remove_label(&mut self, history: HistoryId, label: &str) -> StoreResult<bool> {
        Ok(self
            .histories
            .get_mut(&history)
            .is_some_and(|h| h.labels.remove(label).is_some()))
    }

    fn resolve_label(&self, history: HistoryId, label: &str) -> StoreResult<Option<VersionId>> {
        Ok(self
            .histories
            .get(&history)
            .and_then(|h| h.labels.get(label).copied()))
    }

    fn labels(&self, history: HistoryId) -> StoreResult<Vec<(String, VersionId)>> {
        Ok(self
            .histories
            .get(&history)
            .map(|h| h.labels.iter().map(|(l, v)| (l.clone(), *v)).collect())
            .unwrap_or_default())
    }

    fn find_by_attribute(
        &self,
        under: &str,
        name: &str,
        value: &AttrValue,
    ) -> StoreResult<Vec<String>> {
        let Some(start) = self.lookup(under) else {
            return Ok(Vec::new());
        };
        Ok(self
            .tree
            .subtree_ids(start)
            .into_iter()
            .filter(|&id| {
                self.tree
                    .get_node(id)
                    .is_some_and(|n| n.attributes.get(name) == Some(value))
            })
            .filter_map(|id| self.tree.path_of(id))
            .map(|rel| Self::absolute(&rel))
            .collect())
    }
}
