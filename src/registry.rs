//! Release registry
//!
//! Owns the content store and manages the releases of each release
//! root: the implicit `current` release, numbering, marks, the
//! previous-release chain, and the write path that pins versionables
//! into a release's workspace copy.
//!
//! Author: Moroya Sakamoto

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::change::ChangeEvent;
use crate::config::StagingConfig;
use crate::error::{ReleaseError, Result, StoreError};
use crate::gc::{self, GcResult};
use crate::number::{compare_numbers, NumberPolicy, CURRENT_RELEASE};
use crate::order::{reconcile, OrderResult};
use crate::path;
use crate::release::{
    references, Release, ReleaseId, ReleasedVersionable, ATTR_CHANGE_NUMBER, ATTR_CLOSED,
    ATTR_PREVIOUS_RELEASE, ATTR_REF_HISTORY, ATTR_REF_VERSIONABLE, ATTR_RELEASE_ID,
    ATTR_RELEASE_ROOT, MARK_PREFIX, NODE_METADATA, NODE_WORKSPACE_COPY,
};
use crate::resolver::ReleaseResolver;
use crate::store::{
    walk, AttrValue, ContentStore, HistoryId, NodeKind, VersionableId, ATTR_CREATED,
    ATTR_LAST_MODIFIED, ATTR_VERSION_HISTORY,
};
use crate::sync::{SyncStats, TreeSynchronizer};

// ── Update Outcome ─────────────────────────────────────────────────────

/// A batch item that was rejected
#[derive(Debug)]
pub struct ItemFailure {
    pub item: ReleasedVersionable,
    pub error: ReleaseError,
}

/// What a batch update did.
#[derive(Debug)]
pub struct UpdateOutcome {
    /// Sibling reorderings performed, keyed by the live parent path
    pub reordered: BTreeMap<String, OrderResult>,
    /// Items rejected by validation; the rest of the batch was applied
    pub failures: Vec<ItemFailure>,
    /// Finalized description of the applied changes
    pub event: ChangeEvent,
}

impl UpdateOutcome {
    /// True if every item was applied
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// ── Identity Index ─────────────────────────────────────────────────────

/// Workspace copy path of each referenced history. Built on the first
/// path miss of a batch, then kept current by the batch itself.
#[derive(Debug, Default)]
struct IdentityIndex {
    paths: Option<HashMap<HistoryId, String>>,
}

impl IdentityIndex {
    fn lookup<S: ContentStore + ?Sized>(
        &mut self,
        store: &S,
        release: &Release,
        history: HistoryId,
    ) -> Result<Option<String>> {
        if self.paths.is_none() {
            let mut paths = HashMap::new();
            for (p, item) in references(store, release)? {
                if let Some(h) = item.history_id {
                    paths.insert(h, p);
                }
            }
            debug!(release = %release.number, references = paths.len(), "built identity index");
            self.paths = Some(paths);
        }
        Ok(self.paths.as_ref().and_then(|m| m.get(&history).cloned()))
    }

    fn record(&mut self, history: HistoryId, at: Option<&str>) {
        let Some(paths) = self.paths.as_mut() else {
            return;
        };
        match at {
            Some(p) => {
                paths.insert(history, p.to_string());
            }
            None => {
                paths.remove(&history);
            }
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────────

/// Release manager over a content store.
#[derive(Debug)]
pub struct ReleaseRegistry<S: ContentStore> {
    store: S,
    config: StagingConfig,
    sync: TreeSynchronizer,
}

impl<S: ContentStore + Default> Default for ReleaseRegistry<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: ContentStore> ReleaseRegistry<S> {
    /// Registry with the default staging configuration
    pub fn new(store: S) -> Self {
        let config = StagingConfig::default();
        Self {
            sync: synchronizer(&config),
            store,
            config,
        }
    }

    pub fn with_config(store: S, config: StagingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sync: synchronizer(&config),
            store,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    /// Read-only view of the store through `release`
    pub fn resolver<'a>(&'a self, release: &'a Release) -> ReleaseResolver<'a, S> {
        ReleaseResolver::new(&self.store, release, &self.config)
    }

    // ── Lookup ──

    /// The `current` release of `root`, created on first access.
    ///
    /// Creation marks `root` as a release root and links the new release
    /// to the highest numbered existing one.
    pub fn ensure_current(&mut self, root: &str) -> Result<Release> {
        let root = normalized(root)?;
        self.store.require(&root)?;
        if let Some(current) = self.load(&root, CURRENT_RELEASE)? {
            return Ok(current);
        }

        let previous = self.load_all(&root)?.into_iter().filter(|r| !r.is_current()).last();
        if self.store.attribute(&root, ATTR_RELEASE_ROOT)?.and_then(|v| v.as_bool()) != Some(true)
        {
            self.store
                .set_attribute(&root, ATTR_RELEASE_ROOT, Some(AttrValue::Bool(true)))?;
        }
        let releases = self.config.releases_node(&root);
        self.store.ensure_node(&releases, NodeKind::UnorderedFolder)?;
        let node_path = path::join(&releases, CURRENT_RELEASE);
        if self.store.ensure_node(&node_path, NodeKind::UnorderedFolder)? {
            self.init_release_node(&node_path, previous.as_ref().map(|r| r.id))?;
            info!(
                root = %root,
                previous = ?previous.as_ref().map(|r| r.number.as_str()),
                "created current release"
            );
        }
        self.load(&root, CURRENT_RELEASE)?
            .ok_or_else(|| not_found(&root, CURRENT_RELEASE))
    }

    /// All releases of `root`, lowest number first, `current` last
    pub fn releases(&mut self, root: &str) -> Result<Vec<Release>> {
        let current = self.ensure_current(root)?;
        self.load_all(&current.root)
    }

    pub fn find_release(&mut self, root: &str, number: &str) -> Result<Release> {
        if number == CURRENT_RELEASE {
            return self.ensure_current(root);
        }
        let root = normalized(root)?;
        self.load(&root, number)?
            .ok_or_else(|| not_found(&root, number))
    }

    pub fn find_release_by_id(&mut self, root: &str, id: ReleaseId) -> Result<Option<Release>> {
        Ok(self.releases(root)?.into_iter().find(|r| r.id == id))
    }

    /// Nearest node at or above `path` flagged as a release root
    pub fn find_release_root(&self, path: &str) -> Result<Option<String>> {
        let Some(mut current) = path::normalize(path) else {
            return Ok(None);
        };
        loop {
            let flagged = self
                .store
                .attribute(&current, ATTR_RELEASE_ROOT)?
                .and_then(|v| v.as_bool());
            if flagged == Some(true) {
                return Ok(Some(current));
            }
            match path::parent(&current) {
                Some(parent) => current = parent.to_string(),
                None => return Ok(None),
            }
        }
    }

    /// Stored state of `release`, failing if it was deleted meanwhile
    pub fn reload(&self, release: &Release) -> Result<Release> {
        self.load(&release.root, &release.number)?
            .filter(|r| r.id == release.id)
            .ok_or_else(|| not_found(&release.root, &release.number))
    }

    fn load(&self, root: &str, number: &str) -> Result<Option<Release>> {
        let node_path = path::join(&self.config.releases_node(root), number);
        let Some(node) = self.store.node(&node_path)? else {
            return Ok(None);
        };
        let id = node
            .id_attribute(ATTR_RELEASE_ID)
            .ok_or_else(|| StoreError::Invalid(format!("release node {node_path} has no id")))?;
        Ok(Some(Release {
            id,
            number: number.to_string(),
            root: root.to_string(),
            marks: self.marks_of(root, id)?,
            closed: node
                .attribute(ATTR_CLOSED)
                .and_then(AttrValue::as_bool)
                .unwrap_or(false),
            previous_release: node.id_attribute(ATTR_PREVIOUS_RELEASE),
            change_number: node.id_attribute(ATTR_CHANGE_NUMBER),
            created: date(node.attribute(ATTR_CREATED)),
            last_modified: date(node.attribute(ATTR_LAST_MODIFIED)),
            node_path,
        }))
    }

    fn load_all(&self, root: &str) -> Result<Vec<Release>> {
        let releases = self.config.releases_node(root);
        if !self.store.exists(&releases)? {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for number in self.store.children(&releases)? {
            if let Some(release) = self.load(root, &number)? {
                out.push(release);
            }
        }
        out.sort_by(|a, b| compare_numbers(&a.number, &b.number));
        Ok(out)
    }

    fn marks_of(&self, root: &str, id: ReleaseId) -> Result<Vec<String>> {
        let Some(node) = self.store.node(&self.config.releases_node(root))? else {
            return Ok(Vec::new());
        };
        Ok(node
            .attributes
            .iter()
            .filter(|(_, v)| v.as_id() == Some(id))
            .filter_map(|(k, _)| k.strip_prefix(MARK_PREFIX))
            .map(str::to_string)
            .collect())
    }

    fn init_release_node(&mut self, node_path: &str, previous: Option<ReleaseId>) -> Result<ReleaseId> {
        let id = Uuid::new_v4();
        let now = AttrValue::Date(Utc::now());
        self.store
            .set_attribute(node_path, ATTR_RELEASE_ID, Some(AttrValue::Id(id)))?;
        self.store
            .set_attribute(node_path, ATTR_CREATED, Some(now.clone()))?;
        self.store
            .set_attribute(node_path, ATTR_LAST_MODIFIED, Some(now))?;
        self.store.set_attribute(
            node_path,
            ATTR_CHANGE_NUMBER,
            Some(AttrValue::Id(Uuid::new_v4())),
        )?;
        self.store
            .set_attribute(node_path, ATTR_PREVIOUS_RELEASE, previous.map(AttrValue::Id))?;
        self.store
            .ensure_node(&path::join(node_path, NODE_WORKSPACE_COPY), NodeKind::Folder)?;
        self.store
            .ensure_node(&path::join(node_path, NODE_METADATA), NodeKind::Folder)?;
        Ok(id)
    }

    /// Record a content change on the release node
    fn touch(&mut self, node_path: &str) -> Result<()> {
        self.store.set_attribute(
            node_path,
            ATTR_LAST_MODIFIED,
            Some(AttrValue::Date(Utc::now())),
        )?;
        self.store.set_attribute(
            node_path,
            ATTR_CHANGE_NUMBER,
            Some(AttrValue::Id(Uuid::new_v4())),
        )?;
        Ok(())
    }

    // ── Lifecycle ──

    /// Copy `from` into a new release numbered `policy.bump(from.number)`.
    pub fn create_release(&mut self, from: &Release, policy: &dyn NumberPolicy) -> Result<Release> {
        let from = self.reload(from)?;
        let number = policy.bump(&from.number);
        self.copy_release(&from, &number)
    }

    /// Copy `current` into a new release numbered by bumping the highest
    /// numbered release of `root`.
    pub fn create_next_release(&mut self, root: &str, policy: &dyn NumberPolicy) -> Result<Release> {
        let current = self.ensure_current(root)?;
        let highest = self
            .load_all(&current.root)?
            .into_iter()
            .filter(|r| !r.is_current())
            .last()
            .map(|r| r.number)
            .unwrap_or_else(|| CURRENT_RELEASE.to_string());
        let number = policy.bump(&highest);
        self.copy_release(&current, &number)
    }

    fn copy_release(&mut self, from: &Release, number: &str) -> Result<Release> {
        if number.is_empty() || number.contains('/') || number == CURRENT_RELEASE {
            return Err(ReleaseError::validation(format!(
                "{number:?} is not a valid release number"
            )));
        }
        let node_path = path::join(&self.config.releases_node(&from.root), number);
        if self.store.exists(&node_path)? {
            return Err(ReleaseError::ReleaseExists {
                root: from.root.clone(),
                number: number.to_string(),
            });
        }
        self.store.create_node(&node_path, NodeKind::UnorderedFolder)?;
        let previous = if from.is_current() {
            from.previous_release
        } else {
            Some(from.id)
        };
        let id = self.init_release_node(&node_path, previous)?;
        let copy = path::join(&node_path, NODE_WORKSPACE_COPY);
        let stats = self
            .sync
            .update(&mut self.store, &from.workspace_copy(), &copy)?;

        let release = self
            .load(&from.root, number)?
            .ok_or_else(|| not_found(&from.root, number))?;
        let labelled = self.relabel(&release)?;
        if from.is_current() {
            self.store
                .set_attribute(&from.node_path, ATTR_PREVIOUS_RELEASE, Some(AttrValue::Id(id)))?;
        }
        info!(
            root = %release.root,
            from = %from.number,
            number = %release.number,
            nodes = stats.created,
            labelled,
            "created release"
        );
        Ok(release)
    }

    /// Bind the release label to every snapshot the release references
    fn relabel(&mut self, release: &Release) -> Result<usize> {
        let label = release.label();
        let mut count = 0;
        for (_, item) in references(&self.store, release)? {
            if let (Some(history), Some(version)) = (item.history_id, item.version_id) {
                self.store.add_label(history, version, &label)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Freeze `release` against further content changes
    pub fn close_release(&mut self, release: &Release) -> Result<Release> {
        let release = self.reload(release)?;
        if release.is_current() {
            return Err(ReleaseError::validation("the current release cannot be closed"));
        }
        if !release.closed {
            self.store
                .set_attribute(&release.node_path, ATTR_CLOSED, Some(AttrValue::Bool(true)))?;
            self.store.set_attribute(
                &release.node_path,
                ATTR_LAST_MODIFIED,
                Some(AttrValue::Date(Utc::now())),
            )?;
            info!(root = %release.root, number = %release.number, "closed release");
        }
        self.reload(&release)
    }

    /// Delete an unmarked release.
    ///
    /// Releases that followed it are re-linked to its predecessor, and
    /// release labels left without a referencing release are collected.
    pub fn delete_release(&mut self, release: &Release) -> Result<GcResult> {
        let release = self.reload(release)?;
        if release.is_current() {
            return Err(ReleaseError::validation("the current release cannot be deleted"));
        }
        if !release.marks.is_empty() {
            return Err(ReleaseError::ReleaseProtected {
                number: release.number.clone(),
                marks: release.marks.clone(),
            });
        }
        let histories = gc::referenced_histories(&self.store, &release)?;
        self.store.delete_subtree(&release.node_path)?;

        let remaining = self.load_all(&release.root)?;
        for dependent in remaining
            .iter()
            .filter(|r| r.previous_release == Some(release.id))
        {
            self.store.set_attribute(
                &dependent.node_path,
                ATTR_PREVIOUS_RELEASE,
                release.previous_release.map(AttrValue::Id),
            )?;
        }
        let result = gc::collect_labels(&mut self.store, &remaining, &histories)?;
        info!(
            root = %release.root,
            number = %release.number,
            labels_collected = result.collected,
            "deleted release"
        );
        Ok(result)
    }

    // ── Marks ──

    /// Point mark `name` of the release's root at `release`, moving it off
    /// any other release.
    pub fn set_mark(&mut self, release: &Release, name: &str) -> Result<()> {
        let attr = mark_attribute(name)?;
        let release = self.reload(release)?;
        let releases = self.config.releases_node(&release.root);
        let previous = self
            .store
            .attribute(&releases, &attr)?
            .and_then(|v| v.as_id())
            .filter(|id| *id != release.id);
        self.store
            .set_attribute(&releases, &attr, Some(AttrValue::Id(release.id)))?;
        info!(mark = name, number = %release.number, moved_from = ?previous, "set release mark");
        Ok(())
    }

    pub fn delete_mark(&mut self, release: &Release, name: &str) -> Result<()> {
        let attr = mark_attribute(name)?;
        let release = self.reload(release)?;
        let releases = self.config.releases_node(&release.root);
        let holder = self.store.attribute(&releases, &attr)?.and_then(|v| v.as_id());
        if holder != Some(release.id) {
            return Err(ReleaseError::validation(format!(
                "mark {name:?} does not point at release {}",
                release.number
            )));
        }
        self.store.set_attribute(&releases, &attr, None)?;
        info!(mark = name, number = %release.number, "deleted release mark");
        Ok(())
    }

    pub fn find_release_by_mark(&mut self, root: &str, name: &str) -> Result<Option<Release>> {
        let attr = mark_attribute(name)?;
        let current = self.ensure_current(root)?;
        let releases = self.config.releases_node(&current.root);
        let Some(id) = self.store.attribute(&releases, &attr)?.and_then(|v| v.as_id()) else {
            return Ok(None);
        };
        Ok(self.load_all(&current.root)?.into_iter().find(|r| r.id == id))
    }

    // ── Contents ──

    /// Every version reference of `release`, in tree order
    pub fn list_release_contents(&self, release: &Release) -> Result<Vec<ReleasedVersionable>> {
        Ok(references(&self.store, release)?
            .into_iter()
            .map(|(_, item)| item)
            .collect())
    }

    /// Every live versionable below `root` at its base version
    pub fn list_current_contents(&self, root: &str) -> Result<Vec<ReleasedVersionable>> {
        let root = normalized(root)?;
        let mut out = Vec::new();
        for (p, data) in walk(&self.store, &root, |n| n.kind != NodeKind::Versionable)? {
            if data.kind != NodeKind::Versionable || self.config.is_excluded(&root, &p) {
                continue;
            }
            if let Some(item) = ReleasedVersionable::from_live(&self.store, &root, &p)? {
                out.push(item);
            }
        }
        Ok(out)
    }

    /// Entries of `a` that `b` does not hold at the same version, followed
    /// by entries only `b` holds, flagged inactive.
    pub fn compare_releases(&self, a: &Release, b: &Release) -> Result<Vec<ReleasedVersionable>> {
        let left = self.list_release_contents(a)?;
        let right = self.list_release_contents(b)?;
        let in_b: HashMap<HistoryId, &ReleasedVersionable> = right
            .iter()
            .filter_map(|i| i.history_id.map(|h| (h, i)))
            .collect();
        let in_a: HashSet<HistoryId> = left.iter().filter_map(|i| i.history_id).collect();

        let mut out: Vec<ReleasedVersionable> = left
            .iter()
            .filter(|i| match i.history_id.and_then(|h| in_b.get(&h)) {
                Some(other) => other.version_id != i.version_id,
                None => true,
            })
            .cloned()
            .collect();
        out.extend(
            right
                .iter()
                .filter(|i| i.history_id.is_some_and(|h| !in_a.contains(&h)))
                .map(|i| i.clone().with_active(false)),
        );
        Ok(out)
    }

    /// Reference at `rel_path` below the release root, if any
    pub fn find_released_versionable(
        &self,
        release: &Release,
        rel_path: &str,
    ) -> Result<Option<ReleasedVersionable>> {
        let Some(normal) = path::normalize(&format!("/{}", rel_path.trim_start_matches('/')))
        else {
            return Ok(None);
        };
        let copy = release.workspace_copy();
        Ok(ReleasedVersionable::from_reference(
            &self.store,
            &copy,
            &path::join(&copy, &normal),
        )?)
    }

    pub fn find_released_versionable_by_id(
        &self,
        release: &Release,
        versionable: VersionableId,
    ) -> Result<Option<ReleasedVersionable>> {
        let copy = release.workspace_copy();
        let found = self.store.find_by_attribute(
            &copy,
            ATTR_REF_VERSIONABLE,
            &AttrValue::Id(versionable),
        )?;
        match found.first() {
            Some(p) => Ok(ReleasedVersionable::from_reference(&self.store, &copy, p)?),
            None => Ok(None),
        }
    }

    /// Recreate the versionable released at `rel_path` in the live tree.
    ///
    /// Fails if its history still has a live versionable. Returns the live
    /// path restored to.
    pub fn restore(&mut self, release: &Release, rel_path: &str) -> Result<String> {
        let item = self
            .find_released_versionable(release, rel_path)?
            .ok_or_else(|| {
                ReleaseError::validation(format!(
                    "release {} holds nothing at {rel_path:?}",
                    release.number
                ))
            })?;
        let (Some(history), Some(version)) = (item.history_id, item.version_id) else {
            return Err(ReleaseError::validation(format!(
                "reference at {rel_path:?} is incomplete"
            )));
        };
        let live = self.store.find_by_attribute(
            &release.root,
            ATTR_VERSION_HISTORY,
            &AttrValue::Id(history),
        )?;
        if let Some(existing) = live.first() {
            return Err(ReleaseError::validation(format!(
                "history {history} is still live at {existing}"
            )));
        }
        let target = release.absolute_path(&item.relative_path);
        if let Some(parent) = path::parent(&target) {
            self.store.ensure_node(parent, NodeKind::Folder)?;
        }
        self.store.restore(&target, version)?;
        info!(number = %release.number, path = %target, %version, "restored versionable");
        Ok(target)
    }

    /// Rebuild the workspace copy of `release` from the live tree.
    ///
    /// Checked-in versionables not yet in the release are referenced at
    /// their base version; existing references keep their pinned version.
    pub fn import_live_tree(&mut self, release: &Release) -> Result<(SyncStats, ChangeEvent)> {
        let release = self.reload(release)?;
        if release.closed {
            return Err(ReleaseError::ReleaseClosed(release.number.clone()));
        }
        let before = self.list_release_contents(&release)?;
        let mut sync = self
            .sync
            .clone()
            .skip(&self.config.releases_node(&release.root));
        for rel in &self.config.excluded_paths {
            sync = sync.skip(&path::join(&release.root, rel));
        }
        let stats = sync.update(&mut self.store, &release.root, &release.workspace_copy())?;
        let after = self.list_release_contents(&release)?;

        let label = release.label();
        let kept: HashSet<HistoryId> = after.iter().filter_map(|i| i.history_id).collect();
        for history in before.iter().filter_map(|i| i.history_id) {
            if !kept.contains(&history) {
                self.store.remove_label(history, &label)?;
            }
        }
        self.relabel(&release)?;
        if stats.did_change() {
            self.touch(&release.node_path)?;
        }
        let mut event = ChangeEvent::between(&release, &before, &after)?;
        event.finish();
        info!(number = %release.number, ?stats, "imported live tree");
        Ok((stats, event))
    }

    // ── Update ──

    /// Apply one item; a validation failure is returned as the error.
    pub fn update_release_item(
        &mut self,
        release: &Release,
        item: &ReleasedVersionable,
    ) -> Result<BTreeMap<String, OrderResult>> {
        let mut outcome = self.update_release(release, std::slice::from_ref(item))?;
        match outcome.failures.pop() {
            Some(failure) => Err(failure.error),
            None => Ok(outcome.reordered),
        }
    }

    /// Pin `items` into `release`, in order.
    ///
    /// Invalid items are reported in the outcome and skipped. A closed
    /// release or a store failure aborts the batch; items applied before
    /// a store failure stay applied.
    pub fn update_release(
        &mut self,
        release: &Release,
        items: &[ReleasedVersionable],
    ) -> Result<UpdateOutcome> {
        let release = self.reload(release)?;
        if release.closed {
            return Err(ReleaseError::ReleaseClosed(release.number.clone()));
        }
        let mut outcome = UpdateOutcome {
            reordered: BTreeMap::new(),
            failures: Vec::new(),
            event: ChangeEvent::new(&release),
        };
        let mut index = IdentityIndex::default();
        let mut changed = false;
        for item in items {
            match self.apply_item(&release, item, &mut index, &mut outcome) {
                Ok(applied) => changed |= applied,
                Err(error) if error.is_per_item() => {
                    warn!(
                        number = %release.number,
                        path = %item.relative_path,
                        error = %error,
                        "rejected release update item"
                    );
                    outcome.failures.push(ItemFailure {
                        item: item.clone(),
                        error,
                    });
                }
                Err(error) => {
                    if changed {
                        self.touch(&release.node_path)?;
                    }
                    return Err(error);
                }
            }
        }
        if changed {
            self.touch(&release.node_path)?;
        }
        outcome.event.finish();
        info!(
            number = %release.number,
            items = items.len(),
            failed = outcome.failures.len(),
            reordered = outcome.reordered.len(),
            "updated release"
        );
        Ok(outcome)
    }

    fn apply_item(
        &mut self,
        release: &Release,
        item: &ReleasedVersionable,
        index: &mut IdentityIndex,
        outcome: &mut UpdateOutcome,
    ) -> Result<bool> {
        item.validate(&self.store)?;
        let Some(history) = item.history_id else {
            return Err(ReleaseError::validation("no version history"));
        };
        let copy = release.workspace_copy();
        let target = path::join(&copy, &item.relative_path);
        let label = release.label();

        let found = match self.store.node(&target)? {
            Some(n)
                if n.kind == NodeKind::VersionReference
                    && n.id_attribute(ATTR_REF_HISTORY) == Some(history) =>
            {
                Some(target.clone())
            }
            _ => index.lookup(&self.store, release, history)?,
        };

        let Some(existing) = found else {
            if item.is_removal() {
                self.store.remove_label(history, &label)?;
                return Ok(false);
            }
            self.check_vacant(&target)?;
            self.ensure_folders(release, &target)?;
            self.store.create_node(&target, NodeKind::VersionReference)?;
            item.write_to_reference(&mut self.store, &target)?;
            index.record(history, Some(&target));
            if item.active {
                outcome
                    .event
                    .add_move_or_update(None, Some(item.relative_path.as_str()))?;
            }
            self.pin_label(history, item, &label)?;
            debug!(number = %release.number, path = %item.relative_path, "added reference");
            self.update_parents(release, &target, &mut outcome.reordered)?;
            return Ok(true);
        };

        let old = ReleasedVersionable::from_reference(&self.store, &copy, &existing)?
            .ok_or_else(|| StoreError::NotFound(existing.clone()))?;

        if item.is_removal() {
            self.store.delete_subtree(&existing)?;
            if let Some(parent) = path::parent(&existing) {
                self.remove_orphans(release, parent)?;
            }
            index.record(history, None);
            self.store.remove_label(history, &label)?;
            if old.active {
                outcome
                    .event
                    .add_move_or_update(Some(old.relative_path.as_str()), None)?;
            }
            debug!(number = %release.number, path = %old.relative_path, "removed reference");
            return Ok(true);
        }

        if existing != target {
            self.check_vacant(&target)?;
            self.ensure_folders(release, &target)?;
            self.store.move_subtree(&existing, &target)?;
            if let Some(parent) = path::parent(&existing) {
                self.remove_orphans(release, parent)?;
            }
            index.record(history, Some(&target));
            debug!(
                number = %release.number,
                from = %old.relative_path,
                to = %item.relative_path,
                "moved reference"
            );
        } else if matches!(
            (old.versionable_id, item.versionable_id),
            (Some(a), Some(b)) if a != b
        ) {
            return Err(ReleaseError::validation(format!(
                "{} is referenced by another versionable",
                item.relative_path
            )));
        }

        let mut merged = item.clone();
        if merged.versionable_id.is_none() {
            merged.versionable_id = old.versionable_id;
        }
        merged.write_to_reference(&mut self.store, &target)?;
        let event = &mut outcome.event;
        match (old.active, item.active) {
            (true, true) if old.relative_path != item.relative_path => {
                event.add_move_or_update(Some(old.relative_path.as_str()), Some(item.relative_path.as_str()))?
            }
            (true, true) if old.version_id != item.version_id => {
                event.add_move_or_update(Some(item.relative_path.as_str()), Some(item.relative_path.as_str()))?
            }
            (true, false) => event.add_move_or_update(Some(old.relative_path.as_str()), None)?,
            (false, true) => event.add_move_or_update(None, Some(item.relative_path.as_str()))?,
            _ => {}
        }
        self.pin_label(history, item, &label)?;
        self.update_parents(release, &target, &mut outcome.reordered)?;
        Ok(true)
    }

    fn pin_label(&mut self, history: HistoryId, item: &ReleasedVersionable, label: &str) -> Result<()> {
        if let Some(version) = item.version_id {
            self.store.add_label(history, version, label)?;
        }
        Ok(())
    }

    fn check_vacant(&self, target: &str) -> Result<()> {
        if self.store.exists(target)? {
            return Err(ReleaseError::validation(format!(
                "{target} is already taken in the release"
            )));
        }
        Ok(())
    }

    /// Create the missing ancestors of `target` inside the workspace copy,
    /// taking the folder kind of the live counterpart where there is one.
    /// References are leaves: an ancestor that is one rejects `target`.
    fn ensure_folders(&mut self, release: &Release, target: &str) -> Result<()> {
        let copy = release.workspace_copy();
        let Some(rel) = path::parent(target).and_then(|p| path::relative_to(&copy, p)) else {
            return Ok(());
        };
        let mut current = copy.clone();
        let mut live = release.root.clone();
        for seg in path::segments(rel) {
            current = path::join(&current, seg);
            live = path::join(&live, seg);
            match self.store.node(&current)? {
                Some(n) if n.kind == NodeKind::VersionReference => {
                    return Err(ReleaseError::validation(format!(
                        "{target} lies inside the released versionable {current}"
                    )));
                }
                Some(_) => continue,
                None => {}
            }
            let kind = match self.store.node(&live)? {
                Some(n) if matches!(n.kind, NodeKind::Folder | NodeKind::UnorderedFolder) => n.kind,
                _ => NodeKind::Folder,
            };
            self.store.create_node(&current, kind)?;
        }
        Ok(())
    }

    /// Delete empty non-reference folders from `start` upward, stopping at
    /// the workspace copy root.
    fn remove_orphans(&mut self, release: &Release, start: &str) -> Result<()> {
        let copy = release.workspace_copy();
        let mut current = start.to_string();
        while current != copy && path::is_same_or_descendant(&copy, &current) {
            match self.store.node(&current)? {
                Some(n)
                    if n.kind != NodeKind::VersionReference
                        && self.store.children(&current)?.is_empty() =>
                {
                    self.store.delete_subtree(&current)?;
                    debug!(path = %current, "removed orphaned release folder");
                }
                _ => break,
            }
            match path::parent(&current) {
                Some(parent) => current = parent.to_string(),
                None => break,
            }
        }
        Ok(())
    }

    /// From the release root down to `target`, mirror live folder
    /// attributes and reconcile sibling order at every level where both
    /// trees have the parent.
    fn update_parents(
        &mut self,
        release: &Release,
        target: &str,
        reordered: &mut BTreeMap<String, OrderResult>,
    ) -> Result<()> {
        let copy = release.workspace_copy();
        let Some(rel) = path::relative_to(&copy, target) else {
            return Ok(());
        };
        let mut copy_parent = copy.clone();
        let mut live_parent = release.root.clone();
        for seg in path::segments(rel) {
            let (Some(live), Some(mirror)) = (
                self.store.node(&live_parent)?,
                self.store.node(&copy_parent)?,
            ) else {
                break;
            };
            if is_folder(live.kind) && is_folder(mirror.kind) {
                self.sync
                    .update_attributes(&mut self.store, &live_parent, &copy_parent)?;
            }
            let result = reconcile(&mut self.store, &live_parent, &copy_parent, seg)?;
            if result.is_reordered() {
                OrderResult::combine(reordered, BTreeMap::from([(live_parent.clone(), result)]));
            }
            copy_parent = path::join(&copy_parent, seg);
            live_parent = path::join(&live_parent, seg);
        }
        Ok(())
    }
}

fn synchronizer(config: &StagingConfig) -> TreeSynchronizer {
    TreeSynchronizer::new().with_ignored_attributes(config.ignored_attributes.iter().cloned())
}

fn normalized(root: &str) -> Result<String> {
    path::normalize(root)
        .ok_or_else(|| ReleaseError::validation(format!("{root:?} is not an absolute path")))
}

fn not_found(root: &str, number: &str) -> ReleaseError {
    ReleaseError::ReleaseNotFound {
        root: root.to_string(),
        number: number.to_string(),
    }
}

fn mark_attribute(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(ReleaseError::validation(format!("{name:?} is not a valid mark")));
    }
    Ok(format!("{MARK_PREFIX}{name}"))
}

fn date(value: Option<&AttrValue>) -> Option<DateTime<Utc>> {
    match value {
        Some(AttrValue::Date(d)) => Some(*d),
        _ => None,
    }
}

fn is_folder(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::Folder | NodeKind::UnorderedFolder)
}

// ── Tests ──────────────────────────────────────────────────────────────
