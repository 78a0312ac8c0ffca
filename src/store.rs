//! Content store abstraction
//!
//! The hierarchical versioned store this crate stages releases on.
//! Nodes are addressed by absolute path; versionable nodes check in
//! immutable snapshots that belong to a history and can carry labels.
//!
//! Author: Moroya Sakamoto

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::path;

/// Snapshot identifier
pub type VersionId = Uuid;
/// Version history identifier, stable across all snapshots of one versionable
pub type HistoryId = Uuid;
/// Versionable identity, stable across moves
pub type VersionableId = Uuid;

// ── Attribute Names ───────────────────────────────────────────────────

/// Identity of a versionable node
pub const ATTR_UUID: &str = "uuid";
/// History of a versionable node
pub const ATTR_VERSION_HISTORY: &str = "versionHistory";
/// Snapshot the live versionable was last checked in as
pub const ATTR_BASE_VERSION: &str = "baseVersion";
pub const ATTR_PRIMARY_TYPE: &str = "primaryType";
pub const ATTR_MIXIN_TYPES: &str = "mixinTypes";
pub const ATTR_CREATED: &str = "created";
pub const ATTR_LAST_MODIFIED: &str = "lastModified";

/// What a node is, as far as staging is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Plain folder with explicit child order
    Folder,
    /// Folder whose child order is not under caller control
    UnorderedFolder,
    /// Versionable subtree root
    Versionable,
    /// Release-tree leaf pointing at a snapshot
    VersionReference,
}

impl NodeKind {
    /// True if children can be ordered explicitly
    pub fn is_orderable(self) -> bool {
        matches!(self, NodeKind::Folder | NodeKind::Versionable)
    }
}

/// Attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Identifier (uuid, history, version)
    Id(Uuid),
    /// Multi-valued string
    List(Vec<String>),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl AttrValue {
    pub fn as_id(&self) -> Option<Uuid> {
        match self {
            AttrValue::Id(id) => Some(*id),
            AttrValue::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A node's kind and attributes as read from the store
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    /// Node name (last path segment)
    pub name: String,
    pub kind: NodeKind,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl NodeData {
    /// Get an attribute
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    /// Get an identifier attribute
    pub fn id_attribute(&self, name: &str) -> Option<Uuid> {
        self.attributes.get(name).and_then(AttrValue::as_id)
    }
}

/// Metadata of one checked-in snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub id: VersionId,
    /// History this snapshot belongs to
    pub history_id: HistoryId,
    /// Versionable the snapshot was taken from
    pub versionable_id: VersionableId,
    pub created: DateTime<Utc>,
    /// Labels currently bound to this snapshot
    pub labels: Vec<String>,
    /// Content hash of the frozen subtree
    pub content_hash: u64,
}

// ── Store Trait ────────────────────────────────────────────────────────

/// Primitives consumed from the backing content store.
///
/// Paths are absolute. Frozen content of a snapshot is addressed by a path
/// relative to the frozen root (`""` is the root itself).
pub trait ContentStore {
    /// Node at `path`, `None` if absent
    fn node(&self, path: &str) -> StoreResult<Option<NodeData>>;

    /// Child names of `path` in order
    fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Set (`Some`) or remove (`None`) an attribute
    fn set_attribute(&mut self, path: &str, name: &str, value: Option<AttrValue>)
        -> StoreResult<()>;

    /// Create a node. The parent must exist; fails with `AlreadyExists`
    /// if `path` is taken. Versionable nodes get a fresh identity and history.
    fn create_node(&mut self, path: &str, kind: NodeKind) -> StoreResult<()>;

    /// Move a subtree to `to` (full destination path). Identities are kept.
    fn move_subtree(&mut self, from: &str, to: &str) -> StoreResult<()>;

    fn delete_subtree(&mut self, path: &str) -> StoreResult<()>;

    /// Move child `name` of `parent` before sibling `before`, or to the end.
    fn order_before(&mut self, parent: &str, name: &str, before: Option<&str>)
        -> StoreResult<()>;

    /// Check in the versionable at `path`. Returns the new base snapshot.
    fn checkpoint(&mut self, path: &str) -> StoreResult<SnapshotInfo>;

    fn snapshot(&self, version: VersionId) -> StoreResult<Option<SnapshotInfo>>;

    /// Frozen node of a snapshot, `None` if absent
    fn frozen_node(&self, version: VersionId, rel_path: &str) -> StoreResult<Option<NodeData>>;

    fn frozen_children(&self, version: VersionId, rel_path: &str) -> StoreResult<Vec<String>>;

    /// Recreate a versionable at `path` from a snapshot, keeping its identity.
    fn restore(&mut self, path: &str, version: VersionId) -> StoreResult<()>;

    /// Bind `label` to `version`, moving it off any other snapshot of the history.
    fn add_label(&mut self, history: HistoryId, version: VersionId, label: &str)
        -> StoreResult<()>;

    /// Remove `label` from a history. Returns `true` if it was bound.
    fn remove_label(&mut self, history: HistoryId, label: &str) -> StoreResult<bool>;

    fn resolve_label(&self, history: HistoryId, label: &str) -> StoreResult<Option<VersionId>>;

    /// All labels of a history with the snapshot each is bound to
    fn labels(&self, history: HistoryId) -> StoreResult<Vec<(String, VersionId)>>;

    /// Paths of nodes at or below `under` whose attribute `name` equals `value`
    fn find_by_attribute(&self, under: &str, name: &str, value: &AttrValue)
        -> StoreResult<Vec<String>>;

    // ── Provided ──

    fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.node(path)?.is_some())
    }

    fn attribute(&self, path: &str, name: &str) -> StoreResult<Option<AttrValue>> {
        Ok(self.node(path)?.and_then(|n| n.attributes.get(name).cloned()))
    }

    /// Node at `path` or `StoreError::NotFound`
    fn require(&self, path: &str) -> StoreResult<NodeData> {
        self.node(path)?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    /// Create `path` if absent, creating missing ancestors as folders.
    /// Returns `true` if `path` was created by this call.
    fn ensure_node(&mut self, path: &str, kind: NodeKind) -> StoreResult<bool> {
        if self.exists(path)? {
            return Ok(false);
        }
        if let Some(parent) = path::parent(path) {
            self.ensure_node(parent, NodeKind::Folder)?;
        }
        match self.create_node(path, kind) {
            Ok(()) => Ok(true),
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Pre-order walk of the subtree at `path`, excluding `path` itself.
/// Children of nodes for which `descend` is false are not visited.
pub fn walk<S, F>(store: &S, path: &str, descend: F) -> StoreResult<Vec<(String, NodeData)>>
where
    S: ContentStore + ?Sized,
    F: Fn(&NodeData) -> bool,
{
    let mut out = Vec::new();
    walk_into(store, path, &descend, &mut out)?;
    Ok(out)
}

fn walk_into<S, F>(
    store: &S,
    path: &str,
    descend: &F,
    out: &mut Vec<(String, NodeData)>,
) -> StoreResult<()>
where
    S: ContentStore + ?Sized,
    F: Fn(&NodeData) -> bool,
{
    for name in store.children(path)? {
        let child = path::join(path, &name);
        let Some(data) = store.node(&child)? else {
            continue;
        };
        let deeper = descend(&data);
        out.push((child.clone(), data));
        if deeper {
            walk_into(store, &child, descend, out)?;
        }
    }
    Ok(())
}
