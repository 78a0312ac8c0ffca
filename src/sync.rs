//! Tree synchronization
//!
//! Makes one subtree mirror another: attributes, children and child
//! order. Versionable source nodes are not copied; each becomes a
//! version-reference leaf pinned to the versionable's base snapshot.
//! References already pointing at the same history are left alone, and
//! references whose versionable moved are moved along first.
//!
//! Author: Moroya Sakamoto

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{Result, StoreResult};
use crate::order::apply_order;
use crate::path;
use crate::release::{
    ReleasedVersionable, ATTR_REF_HISTORY, ATTR_RELEASE_ROOT,
};
use crate::store::{
    walk, ContentStore, HistoryId, NodeData, NodeKind, ATTR_BASE_VERSION, ATTR_CREATED,
    ATTR_LAST_MODIFIED, ATTR_UUID, ATTR_VERSION_HISTORY,
};

/// Attributes that describe a node's own identity or bookkeeping and are
/// never copied between trees.
pub const PROTECTED_ATTRIBUTES: &[&str] = &[
    ATTR_UUID,
    ATTR_CREATED,
    ATTR_LAST_MODIFIED,
    ATTR_BASE_VERSION,
    ATTR_VERSION_HISTORY,
    ATTR_RELEASE_ROOT,
];

// ── Sync Stats ─────────────────────────────────────────────────────────

/// What a synchronization pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Nodes created in the destination
    pub created: usize,
    /// Destination subtrees removed
    pub removed: usize,
    /// References written or moved
    pub references: usize,
    /// Nodes whose attributes changed
    pub attributes_updated: usize,
}

impl SyncStats {
    #[inline]
    pub fn did_change(&self) -> bool {
        self.created + self.removed + self.references + self.attributes_updated > 0
    }
}

// ── Synchronizer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TreeSynchronizer {
    ignored: HashSet<String>,
    skipped: Vec<String>,
}

impl TreeSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also never copy these attributes
    pub fn with_ignored_attributes<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.ignored.extend(names.into_iter().map(Into::into));
        self
    }

    /// Never descend into the source subtree at `abs_path`
    pub fn skip(mut self, abs_path: &str) -> Self {
        self.skipped.push(abs_path.to_string());
        self
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        PROTECTED_ATTRIBUTES.contains(&name) || self.ignored.contains(name)
    }

    fn is_skipped(&self, source_path: &str, to: &str) -> bool {
        // the destination itself may live inside the source
        path::is_same_or_descendant(source_path, to)
            || self
                .skipped
                .iter()
                .any(|s| path::is_same_or_descendant(s, source_path))
    }

    /// Make the subtree at `to` mirror the subtree at `from`. `to` must exist.
    pub fn update<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        from: &str,
        to: &str,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        self.move_references(store, from, to, &mut stats)?;
        self.update_node(store, from, to, &mut stats)?;
        debug!(from, to, ?stats, "synchronized tree");
        Ok(stats)
    }

    /// Copy unprotected attributes of `from` onto `to` and remove those `to`
    /// has but `from` lacks. Returns `true` if anything changed.
    pub fn update_attributes<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        from: &str,
        to: &str,
    ) -> StoreResult<bool> {
        let source = store.require(from)?;
        let dest = store.require(to)?;
        self.copy_attributes(store, &source, &dest, to)
    }

    fn copy_attributes<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        source: &NodeData,
        dest: &NodeData,
        to: &str,
    ) -> StoreResult<bool> {
        let mut changed = false;
        for (name, value) in &source.attributes {
            if self.is_ignored(name) || dest.attributes.get(name) == Some(value) {
                continue;
            }
            store.set_attribute(to, name, Some(value.clone()))?;
            changed = true;
        }
        for name in dest.attributes.keys() {
            if !self.is_ignored(name) && !source.attributes.contains_key(name) {
                store.set_attribute(to, name, None)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn update_node<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        from: &str,
        to: &str,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let source = store.require(from)?;
        let dest = store.require(to)?;
        match source.kind {
            NodeKind::Versionable => self.write_reference(store, &source, &dest, from, to, stats),
            NodeKind::VersionReference => {
                if self.copy_reference(store, &source, &dest, to)? {
                    stats.references += 1;
                }
                Ok(())
            }
            NodeKind::Folder | NodeKind::UnorderedFolder => {
                if self.copy_attributes(store, &source, &dest, to)? {
                    stats.attributes_updated += 1;
                }
                self.update_children(store, from, to, stats)
            }
        }
    }

    fn update_children<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        from: &str,
        to: &str,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let mut wanted = Vec::new();
        for name in store.children(from)? {
            let child = path::join(from, &name);
            if self.is_skipped(&child, to) {
                continue;
            }
            let Some(data) = store.node(&child)? else {
                continue;
            };
            if data.kind == NodeKind::Versionable && data.id_attribute(ATTR_BASE_VERSION).is_none() {
                warn!(path = %child, "versionable was never checked in, not referenced");
                continue;
            }
            wanted.push((name, data.kind));
        }

        for name in store.children(to)? {
            if !wanted.iter().any(|(w, _)| *w == name) {
                store.delete_subtree(&path::join(to, &name))?;
                stats.removed += 1;
            }
        }

        for (name, kind) in &wanted {
            let target_kind = match kind {
                NodeKind::Versionable => NodeKind::VersionReference,
                other => *other,
            };
            let dest = path::join(to, name);
            match store.node(&dest)? {
                Some(existing) if existing.kind == target_kind => {}
                Some(_) => {
                    store.delete_subtree(&dest)?;
                    store.create_node(&dest, target_kind)?;
                    stats.created += 1;
                }
                None => {
                    store.create_node(&dest, target_kind)?;
                    stats.created += 1;
                }
            }
            self.update_node(store, &path::join(from, name), &dest, stats)?;
        }

        let order: Vec<String> = wanted.into_iter().map(|(n, _)| n).collect();
        if store.require(to)?.kind.is_orderable() && store.children(to)? != order {
            apply_order(store, to, &order)?;
        }
        Ok(())
    }

    fn write_reference<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        source: &NodeData,
        dest: &NodeData,
        from: &str,
        to: &str,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let history = source.id_attribute(ATTR_VERSION_HISTORY);
        if dest.kind == NodeKind::VersionReference
            && history.is_some()
            && dest.id_attribute(ATTR_REF_HISTORY) == history
        {
            return Ok(());
        }
        if source.id_attribute(ATTR_BASE_VERSION).is_none() {
            warn!(path = from, "versionable was never checked in, not referenced");
            return Ok(());
        }
        for child in store.children(to)? {
            store.delete_subtree(&path::join(to, &child))?;
        }
        for name in dest.attributes.keys() {
            store.set_attribute(to, name, None)?;
        }
        let item = ReleasedVersionable::new(
            path::name(from),
            source.id_attribute(ATTR_UUID),
            source.id_attribute(ATTR_BASE_VERSION),
            history,
        );
        item.write_to_reference(store, to)?;
        stats.references += 1;
        Ok(())
    }

    /// Copy a reference verbatim, identity fields included
    fn copy_reference<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        source: &NodeData,
        dest: &NodeData,
        to: &str,
    ) -> StoreResult<bool> {
        if source.attributes == dest.attributes {
            return Ok(false);
        }
        for name in dest.attributes.keys() {
            if !source.attributes.contains_key(name) {
                store.set_attribute(to, name, None)?;
            }
        }
        for (name, value) in &source.attributes {
            store.set_attribute(to, name, Some(value.clone()))?;
        }
        Ok(true)
    }

    /// Move references in `to` whose versionable now lives elsewhere in
    /// `from`, so identity is kept across the following pass.
    fn move_references<S: ContentStore + ?Sized>(
        &self,
        store: &mut S,
        from: &str,
        to: &str,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let mut live: HashMap<HistoryId, String> = HashMap::new();
        for (p, data) in walk(store, from, |n| n.kind != NodeKind::Versionable)? {
            if data.kind != NodeKind::Versionable || self.is_skipped(&p, to) {
                continue;
            }
            if let (Some(h), Some(rel)) = (
                data.id_attribute(ATTR_VERSION_HISTORY),
                path::relative_to(from, &p),
            ) {
                live.insert(h, rel.to_string());
            }
        }
        if live.is_empty() {
            return Ok(());
        }
        let references = walk(store, to, |n| n.kind != NodeKind::VersionReference)?;
        for (p, data) in references {
            if data.kind != NodeKind::VersionReference {
                continue;
            }
            let Some(rel_now) = path::relative_to(to, &p) else {
                continue;
            };
            let Some(rel_live) = data.id_attribute(ATTR_REF_HISTORY).and_then(|h| live.get(&h))
            else {
                continue;
            };
            if rel_now == rel_live.as_str() {
                continue;
            }
            let target = path::join(to, rel_live);
            if store.exists(&target)? {
                continue;
            }
            if let Some(parent) = path::parent(&target) {
                store.ensure_node(parent, NodeKind::Folder)?;
            }
            debug!(from = %p, to = %target, "moving reference after live move");
            store.move_subtree(&p, &target)?;
            stats.references += 1;
        }
        Ok(())
    }
}
