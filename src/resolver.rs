//! Release path resolution
//!
//! Answers a lookup against a release as if the release were the live
//! tree. Paths outside the release root, paths under an overlay node and
//! paths the mapper refuses come from the live tree. Everything else is
//! walked through the workspace copy, stepping into a snapshot's frozen
//! copy whenever a version reference is crossed. A deactivated reference
//! hides itself and everything below it.
//!
//! Resolution never fails: malformed paths, excluded paths, missing nodes
//! and broken references all resolve to `None`.
//!
//! Author: Moroya Sakamoto

use std::collections::BTreeMap;

use tracing::error;

use crate::config::StagingConfig;
use crate::path;
use crate::release::{Release, ATTR_REF_DEACTIVATED, ATTR_REF_HISTORY, ATTR_REF_VERSION};
use crate::store::{
    AttrValue, ContentStore, HistoryId, NodeData, NodeKind, VersionId, ATTR_MIXIN_TYPES,
    ATTR_PRIMARY_TYPE, ATTR_UUID,
};

// ── Frozen Attribute Names ─────────────────────────────────────────────

/// Live attribute name → name of the same attribute in a frozen copy
pub const FROZEN_NAMES: [(&str, &str); 3] = [
    (ATTR_UUID, "frozenUuid"),
    (ATTR_PRIMARY_TYPE, "frozenPrimaryType"),
    (ATTR_MIXIN_TYPES, "frozenMixinTypes"),
];

/// Name under which a live attribute is stored in a frozen copy
pub fn to_frozen_name(name: &str) -> &str {
    FROZEN_NAMES
        .iter()
        .find(|(real, _)| *real == name)
        .map_or(name, |&(_, frozen)| frozen)
}

/// Live name of a frozen-copy attribute
pub fn to_real_name(name: &str) -> &str {
    FROZEN_NAMES
        .iter()
        .find(|(_, frozen)| *frozen == name)
        .map_or(name, |&(real, _)| real)
}

// ── Mapping Policy ─────────────────────────────────────────────────────

/// Decides whether a path may be served from a release at all.
pub trait ReleaseMapper {
    fn may_map(&self, abs_path: &str) -> bool;
}

/// Maps every path
#[derive(Debug, Clone, Copy, Default)]
pub struct MapAll;

impl ReleaseMapper for MapAll {
    fn may_map(&self, _abs_path: &str) -> bool {
        true
    }
}

impl<F: Fn(&str) -> bool> ReleaseMapper for F {
    fn may_map(&self, abs_path: &str) -> bool {
        self(abs_path)
    }
}

// ── Resolved Nodes ─────────────────────────────────────────────────────

/// Result of a resolution, read-only.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// A stored node: the live tree or a plain workspace-copy node
    Live {
        path: String,
        store_path: String,
        data: NodeData,
    },
    /// A node inside a snapshot's frozen copy
    Frozen {
        path: String,
        version: VersionId,
        history: HistoryId,
        rel_path: String,
        data: NodeData,
    },
    /// An attribute addressed by path
    Property {
        path: String,
        name: String,
        value: AttrValue,
    },
}

impl Resolved {
    /// Path as requested, in the live namespace
    pub fn path(&self) -> &str {
        match self {
            Resolved::Live { path, .. }
            | Resolved::Frozen { path, .. }
            | Resolved::Property { path, .. } => path,
        }
    }

    pub fn name(&self) -> &str {
        path::name(self.path())
    }

    /// Node kind; `None` for properties
    pub fn kind(&self) -> Option<NodeKind> {
        match self {
            Resolved::Live { data, .. } | Resolved::Frozen { data, .. } => Some(data.kind),
            Resolved::Property { .. } => None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Resolved::Frozen { .. })
    }

    /// Snapshot a frozen node belongs to
    pub fn version(&self) -> Option<VersionId> {
        match self {
            Resolved::Frozen { version, .. } => Some(*version),
            _ => None,
        }
    }

    /// Attribute by live name
    pub fn attribute(&self, name: &str) -> Option<&AttrValue> {
        match self {
            Resolved::Live { data, .. } => data.attribute(name),
            Resolved::Frozen { data, .. } => data.attribute(to_frozen_name(name)),
            Resolved::Property { .. } => None,
        }
    }

    /// All attributes under their live names
    pub fn attributes(&self) -> BTreeMap<String, AttrValue> {
        match self {
            Resolved::Live { data, .. } => data.attributes.clone(),
            Resolved::Frozen { data, .. } => data
                .attributes
                .iter()
                .map(|(k, v)| (to_real_name(k).to_string(), v.clone()))
                .collect(),
            Resolved::Property { .. } => BTreeMap::new(),
        }
    }

    /// Value of a resolved property
    pub fn value(&self) -> Option<&AttrValue> {
        match self {
            Resolved::Property { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Position of a walk through the release
#[derive(Debug, Clone)]
enum Cursor {
    Stored {
        store_path: String,
        data: NodeData,
    },
    Frozen {
        version: VersionId,
        history: HistoryId,
        rel_path: String,
        data: NodeData,
    },
}

impl Cursor {
    fn data(&self) -> &NodeData {
        match self {
            Cursor::Stored { data, .. } | Cursor::Frozen { data, .. } => data,
        }
    }

    fn into_resolved(self, path: String) -> Resolved {
        match self {
            Cursor::Stored { store_path, data } => Resolved::Live {
                path,
                store_path,
                data,
            },
            Cursor::Frozen {
                version,
                history,
                rel_path,
                data,
            } => Resolved::Frozen {
                path,
                version,
                history,
                rel_path,
                data,
            },
        }
    }
}

// ── Resolver ───────────────────────────────────────────────────────────

/// Resolves paths against one release.
pub struct ReleaseResolver<'a, S: ?Sized> {
    store: &'a S,
    release: &'a Release,
    config: &'a StagingConfig,
    mapper: &'a dyn ReleaseMapper,
}

impl<'a, S: ContentStore + ?Sized> ReleaseResolver<'a, S> {
    pub fn new(store: &'a S, release: &'a Release, config: &'a StagingConfig) -> Self {
        Self {
            store,
            release,
            config,
            mapper: &MapAll,
        }
    }

    pub fn with_mapper(mut self, mapper: &'a dyn ReleaseMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn release(&self) -> &Release {
        self.release
    }

    /// True if `abs_path` is hidden from the release view
    pub fn is_filtered(&self, abs_path: &str) -> bool {
        self.config.is_excluded(&self.release.root, abs_path)
    }

    /// True if `abs_path` is answered straight from the live tree
    pub fn is_direct(&self, abs_path: &str) -> bool {
        !self.release.applies_to_path(abs_path)
            || !self.mapper.may_map(abs_path)
            || self.config.is_overlaid(&self.release.root, abs_path)
    }

    /// Resolve `path` as seen through the release.
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        let path = path::normalize(path)?;
        if self.is_filtered(&path) {
            return None;
        }
        if self.is_direct(&path) {
            return self.resolve_live(path);
        }

        let rel = self.release.relative_path(&path)?.to_string();
        let copy = self.release.workspace_copy();
        let mut cursor = Cursor::Stored {
            data: self.read(self.store.node(&copy))??,
            store_path: copy,
        };
        let segments: Vec<&str> = path::segments(&rel).collect();
        for (i, seg) in segments.iter().enumerate() {
            match self.child(&cursor, seg) {
                Some(next) => cursor = self.step(next)?,
                None if i + 1 == segments.len() => {
                    return self.property(&cursor, seg, path.clone());
                }
                None => return None,
            }
        }
        Some(cursor.into_resolved(path))
    }

    /// Children of a resolved node, each re-resolved through the release.
    /// Deactivated and excluded children are dropped; the release root
    /// also lists the overlay nodes of the live tree.
    pub fn list_children(&self, node: &Resolved) -> Vec<Resolved> {
        let names = match node {
            Resolved::Live { store_path, .. } => self.read(self.store.children(store_path)),
            Resolved::Frozen {
                version, rel_path, ..
            } => self.read(self.store.frozen_children(*version, rel_path)),
            Resolved::Property { .. } => None,
        }
        .unwrap_or_default();

        let parent = node.path();
        let mut out = Vec::new();
        let mut overlaid: Vec<String> = Vec::new();
        if parent == self.release.root && !self.is_direct(parent) {
            for rel in &self.config.overlay_nodes {
                if rel.contains('/') {
                    continue;
                }
                if let Some(child) = self.resolve(&path::join(parent, rel)) {
                    overlaid.push(rel.clone());
                    out.push(child);
                }
            }
        }
        for name in names {
            if overlaid.contains(&name) {
                continue;
            }
            if let Some(child) = self.resolve(&path::join(parent, &name)) {
                out.push(child);
            }
        }
        out
    }

    fn resolve_live(&self, path: String) -> Option<Resolved> {
        if let Some(data) = self.read(self.store.node(&path))? {
            return Some(Resolved::Live {
                store_path: path.clone(),
                path,
                data,
            });
        }
        let parent = path::parent(&path)?;
        let value = self.read(self.store.attribute(parent, path::name(&path)))??;
        Some(Resolved::Property {
            name: path::name(&path).to_string(),
            path,
            value,
        })
    }

    fn child(&self, cursor: &Cursor, name: &str) -> Option<Cursor> {
        match cursor {
            Cursor::Stored { store_path, .. } => {
                let child = path::join(store_path, name);
                let data = self.read(self.store.node(&child))??;
                Some(Cursor::Stored {
                    store_path: child,
                    data,
                })
            }
            Cursor::Frozen {
                version,
                history,
                rel_path,
                ..
            } => {
                let child = path::join(rel_path, name).trim_start_matches('/').to_string();
                let data = self.read(self.store.frozen_node(*version, &child))??;
                Some(Cursor::Frozen {
                    version: *version,
                    history: *history,
                    rel_path: child,
                    data,
                })
            }
        }
    }

    /// Cross a version reference into its snapshot
    fn step(&self, cursor: Cursor) -> Option<Cursor> {
        let data = cursor.data();
        if data.kind != NodeKind::VersionReference {
            return Some(cursor);
        }
        let deactivated = data
            .attribute(ATTR_REF_DEACTIVATED)
            .and_then(AttrValue::as_bool)
            .unwrap_or(false);
        if deactivated {
            return None;
        }
        let reference = match &cursor {
            Cursor::Stored { store_path, .. } => store_path.as_str(),
            Cursor::Frozen { rel_path, .. } => rel_path.as_str(),
        };
        let (Some(version), Some(history)) = (
            data.id_attribute(ATTR_REF_VERSION),
            data.id_attribute(ATTR_REF_HISTORY),
        ) else {
            error!(reference, "version reference without version or history");
            return None;
        };
        match self.store.frozen_node(version, "") {
            Ok(Some(frozen)) => Some(Cursor::Frozen {
                version,
                history,
                rel_path: String::new(),
                data: frozen,
            }),
            Ok(None) | Err(_) => {
                error!(reference, %version, "broken version reference");
                None
            }
        }
    }

    fn property(&self, cursor: &Cursor, name: &str, path: String) -> Option<Resolved> {
        let stored_name = match cursor {
            Cursor::Stored { .. } => name,
            Cursor::Frozen { .. } => to_frozen_name(name),
        };
        let value = cursor.data().attribute(stored_name)?.clone();
        Some(Resolved::Property {
            path,
            name: name.to_string(),
            value,
        })
    }

    fn read<T>(&self, result: crate::error::StoreResult<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                error!(error = %e, release = %self.release.number, "store read failed");
                None
            }
        }
    }
}
