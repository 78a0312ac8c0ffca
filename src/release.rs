//! Release model
//!
//! A release is stored below its root as
//! `<releases_path>/<number>/{root, metaData}`: `root` is the workspace
//! copy mirroring the live namespace, with versionable subtrees replaced
//! by version-reference leaves.
//!
//! Author: Moroya Sakamoto

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReleaseError, Result, StoreResult};
use crate::number::CURRENT_RELEASE;
use crate::path;
use crate::store::{
    walk, AttrValue, ContentStore, HistoryId, NodeData, NodeKind, VersionId, VersionableId,
    ATTR_BASE_VERSION, ATTR_UUID, ATTR_VERSION_HISTORY,
};

/// Release identifier
pub type ReleaseId = Uuid;

// ── Storage Names ──────────────────────────────────────────────────────

/// Workspace copy node below a release node
pub const NODE_WORKSPACE_COPY: &str = "root";
/// Caller-owned metadata node below a release node
pub const NODE_METADATA: &str = "metaData";
/// Prefix of the label binding a snapshot to a release
pub const LABEL_PREFIX: &str = "release-";
/// Prefix of mark attributes on the releases node
pub const MARK_PREFIX: &str = "mark.";

pub const ATTR_RELEASE_ID: &str = "releaseId";
pub const ATTR_CLOSED: &str = "closed";
pub const ATTR_PREVIOUS_RELEASE: &str = "previousRelease";
pub const ATTR_CHANGE_NUMBER: &str = "changeNumber";
/// Flag on a live node that owns releases
pub const ATTR_RELEASE_ROOT: &str = "releaseRoot";

// ── Version Reference Attributes ───────────────────────────────────────

pub const ATTR_REF_HISTORY: &str = "release:versionHistory";
pub const ATTR_REF_VERSION: &str = "release:version";
pub const ATTR_REF_VERSIONABLE: &str = "release:versionableUuid";
pub const ATTR_REF_DEACTIVATED: &str = "release:deactivated";

/// Label binding snapshots to the release numbered `number`
pub fn release_label(number: &str) -> String {
    format!("{LABEL_PREFIX}{number}")
}

/// A release of one release root, as currently stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    /// `rN(.N)*` or `current`
    pub number: String,
    /// Live release root
    pub root: String,
    /// Release node holding workspace copy and metadata
    pub node_path: String,
    /// Marks pointing at this release, sorted
    pub marks: Vec<String>,
    pub closed: bool,
    pub previous_release: Option<ReleaseId>,
    /// Regenerated on every content change
    pub change_number: Option<Uuid>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Release {
    pub fn is_current(&self) -> bool {
        self.number == CURRENT_RELEASE
    }

    /// Label bound to every snapshot this release references
    pub fn label(&self) -> String {
        release_label(&self.number)
    }

    pub fn workspace_copy(&self) -> String {
        path::join(&self.node_path, NODE_WORKSPACE_COPY)
    }

    pub fn metadata_path(&self) -> String {
        path::join(&self.node_path, NODE_METADATA)
    }

    /// True if `abs_path` is the release root or below it
    pub fn applies_to_path(&self, abs_path: &str) -> bool {
        path::is_same_or_descendant(&self.root, abs_path)
    }

    /// Absolute live path of a path relative to the release root.
    /// Absolute input is returned unchanged.
    pub fn absolute_path(&self, rel_or_abs: &str) -> String {
        if rel_or_abs.starts_with('/') {
            rel_or_abs.to_string()
        } else {
            path::join(&self.root, rel_or_abs)
        }
    }

    /// Path relative to the release root, `None` outside it
    pub fn relative_path<'a>(&self, abs_path: &'a str) -> Option<&'a str> {
        path::relative_to(&self.root, abs_path)
    }

    /// Workspace copy path mirroring a live path
    pub fn map_to_workspace_copy(&self, abs_path: &str) -> Option<String> {
        self.relative_path(abs_path)
            .map(|rel| path::join(&self.workspace_copy(), rel))
    }

    /// Live path mirrored by a workspace copy path
    pub fn map_from_workspace_copy(&self, copy_path: &str) -> Option<String> {
        path::relative_to(&self.workspace_copy(), copy_path).map(|rel| path::join(&self.root, rel))
    }
}

/// One versionable as released, or as it should be released.
///
/// `version_id == None` requests removal from the release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleasedVersionable {
    /// Path relative to the release root
    pub relative_path: String,
    pub versionable_id: Option<VersionableId>,
    pub version_id: Option<VersionId>,
    pub history_id: Option<HistoryId>,
    pub active: bool,
}

impl ReleasedVersionable {
    pub fn new(
        relative_path: &str,
        versionable_id: Option<VersionableId>,
        version_id: Option<VersionId>,
        history_id: Option<HistoryId>,
    ) -> Self {
        Self {
            relative_path: relative_path.trim_matches('/').to_string(),
            versionable_id,
            version_id,
            history_id,
            active: true,
        }
    }

    /// Current state of the live versionable at `abs_path`, pinned to its
    /// base version. `None` if there is no versionable.
    pub fn from_live<S: ContentStore + ?Sized>(
        store: &S,
        root: &str,
        abs_path: &str,
    ) -> StoreResult<Option<Self>> {
        let Some(rel) = path::relative_to(root, abs_path) else {
            return Ok(None);
        };
        Ok(store
            .node(abs_path)?
            .filter(|n| n.kind == NodeKind::Versionable)
            .map(|n| {
                Self::new(
                    rel,
                    n.id_attribute(ATTR_UUID),
                    n.id_attribute(ATTR_BASE_VERSION),
                    n.id_attribute(ATTR_VERSION_HISTORY),
                )
            }))
    }

    /// State of the version reference at `ref_path` in a workspace copy
    pub fn from_reference<S: ContentStore + ?Sized>(
        store: &S,
        workspace_copy: &str,
        ref_path: &str,
    ) -> StoreResult<Option<Self>> {
        let Some(rel) = path::relative_to(workspace_copy, ref_path) else {
            return Ok(None);
        };
        Ok(store
            .node(ref_path)?
            .filter(|n| n.kind == NodeKind::VersionReference)
            .map(|n| Self::from_reference_data(rel, &n)))
    }

    pub(crate) fn from_reference_data(rel: &str, node: &NodeData) -> Self {
        let deactivated = node
            .attribute(ATTR_REF_DEACTIVATED)
            .and_then(AttrValue::as_bool)
            .unwrap_or(false);
        Self {
            active: !deactivated,
            ..Self::new(
                rel,
                node.id_attribute(ATTR_REF_VERSIONABLE),
                node.id_attribute(ATTR_REF_VERSION),
                node.id_attribute(ATTR_REF_HISTORY),
            )
        }
    }

    /// Same item with the version cleared: removes it from the release
    pub fn removal(mut self) -> Self {
        self.version_id = None;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn at_path(mut self, relative_path: &str) -> Self {
        self.relative_path = relative_path.trim_matches('/').to_string();
        self
    }

    pub fn is_removal(&self) -> bool {
        self.version_id.is_none()
    }

    /// Check the item can be applied against `store`.
    pub fn validate<S: ContentStore + ?Sized>(&self, store: &S) -> Result<()> {
        let Some(history) = self.history_id else {
            return Err(ReleaseError::validation(format!(
                "no version history for {:?}",
                self.relative_path
            )));
        };
        if self.relative_path.trim().is_empty() {
            return Err(ReleaseError::validation("blank relative path"));
        }
        if path::normalize(&format!("/{}", self.relative_path)).as_deref()
            != Some(format!("/{}", self.relative_path).as_str())
        {
            return Err(ReleaseError::validation(format!(
                "relative path {:?} is not normalized",
                self.relative_path
            )));
        }
        if let Some(version) = self.version_id {
            match store.snapshot(version)? {
                Some(snap) if snap.history_id == history => {}
                Some(_) => {
                    return Err(ReleaseError::validation(format!(
                        "version {version} does not belong to history {history}"
                    )))
                }
                None => {
                    return Err(ReleaseError::validation(format!(
                        "version {version} was never checked in"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Write this item's identity into the reference node at `ref_path`.
    pub fn write_to_reference<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        ref_path: &str,
    ) -> StoreResult<()> {
        store.set_attribute(ref_path, ATTR_REF_HISTORY, self.history_id.map(AttrValue::Id))?;
        store.set_attribute(ref_path, ATTR_REF_VERSION, self.version_id.map(AttrValue::Id))?;
        store.set_attribute(
            ref_path,
            ATTR_REF_VERSIONABLE,
            self.versionable_id.map(AttrValue::Id),
        )?;
        store.set_attribute(
            ref_path,
            ATTR_REF_DEACTIVATED,
            (!self.active).then_some(AttrValue::Bool(true)),
        )?;
        Ok(())
    }
}

/// Every version reference in the workspace copy of `release` in
/// pre-order, with its store path. Empty if the copy is gone.
pub fn references<S: ContentStore + ?Sized>(
    store: &S,
    release: &Release,
) -> StoreResult<Vec<(String, ReleasedVersionable)>> {
    let copy = release.workspace_copy();
    if !store.exists(&copy)? {
        return Ok(Vec::new());
    }
    Ok(walk(store, &copy, |n| n.kind != NodeKind::VersionReference)?
        .into_iter()
        .filter(|(_, data)| data.kind == NodeKind::VersionReference)
        .filter_map(|(p, data)| {
            let item = path::relative_to(&copy, &p)
                .map(|rel| ReleasedVersionable::from_reference_data(rel, &data))?;
            Some((p, item))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn release() -> Release {
        Release {
            id: Uuid::new_v4(),
            number: String::from("r1"),
            root: String::from("/site"),
            node_path: String::from("/site/meta/releases/r1"),
            marks: Vec::new(),
            closed: false,
            previous_release: None,
            change_number: None,
            created: None,
            last_modified: None,
        }
    }

    #[test]
    fn test_release_paths() {
        let r = release();
        assert_eq!(r.label(), "release-r1");
        assert_eq!(r.workspace_copy(), "/site/meta/releases/r1/root");
        assert_eq!(r.absolute_path("a/doc"), "/site/a/doc");
        assert_eq!(r.absolute_path("/other"), "/other");
        assert_eq!(
            r.map_to_workspace_copy("/site/a").as_deref(),
            Some("/site/meta/releases/r1/root/a")
        );
        assert_eq!(
            r.map_from_workspace_copy("/site/meta/releases/r1/root/a").as_deref(),
            Some("/site/a")
        );
        assert!(r.map_to_workspace_copy("/elsewhere").is_none());
        assert!(!r.is_current());
    }

    #[test]
    fn test_from_live_uses_base_version() {
        let mut store = MemoryStore::new();
        store.ensure_node("/site/a", NodeKind::Folder).unwrap();
        store.create_node("/site/a/doc", NodeKind::Versionable).unwrap();
        let v1 = store.checkpoint("/site/a/doc").unwrap();
        let item = ReleasedVersionable::from_live(&store, "/site", "/site/a/doc")
            .unwrap()
            .unwrap();
        assert_eq!(item.relative_path, "a/doc");
        assert_eq!(item.version_id, Some(v1.id));
        assert_eq!(item.history_id, Some(v1.history_id));
        assert!(item.active);
        assert!(ReleasedVersionable::from_live(&store, "/site", "/site/a")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reference_round_trip() {
        let mut store = MemoryStore::new();
        store.ensure_node("/copy/a/ref", NodeKind::VersionReference).unwrap();
        let item = ReleasedVersionable::new(
            "a/ref",
            Some(Uuid::new_v4()),
            Some(Uuid::new_v4()),
            Some(Uuid::new_v4()),
        )
        .with_active(false);
        item.write_to_reference(&mut store, "/copy/a/ref").unwrap();
        let read = ReleasedVersionable::from_reference(&store, "/copy", "/copy/a/ref")
            .unwrap()
            .unwrap();
        assert_eq!(read, item);
    }

    #[test]
    fn test_validate() {
        let mut store = MemoryStore::new();
        store.ensure_node("/site/doc", NodeKind::Versionable).unwrap();
        let v1 = store.checkpoint("/site/doc").unwrap();
        let ok = ReleasedVersionable::new("doc", None, Some(v1.id), Some(v1.history_id));
        assert!(ok.validate(&store).is_ok());

        let no_history = ReleasedVersionable::new("doc", None, Some(v1.id), None);
        assert!(no_history.validate(&store).unwrap_err().is_per_item());

        let blank = ReleasedVersionable::new("", None, None, Some(v1.history_id));
        assert!(blank.validate(&store).is_err());

        let foreign = ReleasedVersionable::new("doc", None, Some(v1.id), Some(Uuid::new_v4()));
        assert!(foreign.validate(&store).is_err());

        let unknown = ReleasedVersionable::new("doc", None, Some(Uuid::new_v4()), Some(v1.history_id));
        assert!(unknown.validate(&store).is_err());

        let removal = ok.clone().removal();
        assert!(removal.validate(&store).is_ok());
        assert!(removal.is_removal());
    }
}
