//! Release change events
//!
//! Minimal description of what changed in a release, handed to
//! replication. Each path set stays ancestor-free: a path already covered
//! by an ancestor is dropped, and adding an ancestor drops its
//! descendants. Moves are kept apart from add/remove pairs.
//!
//! Author: Moroya Sakamoto

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::{ReleaseError, Result};
use crate::path;
use crate::release::{Release, ReleasedVersionable};
use crate::store::HistoryId;

/// Changes of one release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    release_number: String,
    release_root: String,
    /// Paths below it are reported under `release_root`
    workspace_copy: String,
    new_paths: IndexSet<String>,
    updated_paths: IndexSet<String>,
    removed_paths: IndexSet<String>,
    /// from → to
    moved_paths: IndexMap<String, String>,
    force_full_check: bool,
    finalized: bool,
}

impl ChangeEvent {
    pub fn new(release: &Release) -> Self {
        Self {
            release_number: release.number.clone(),
            release_root: release.root.clone(),
            workspace_copy: release.workspace_copy(),
            new_paths: IndexSet::new(),
            updated_paths: IndexSet::new(),
            removed_paths: IndexSet::new(),
            moved_paths: IndexMap::new(),
            force_full_check: false,
            finalized: false,
        }
    }

    /// Event telling consumers the whole release changed
    pub fn full_update(release: &Release) -> Self {
        let mut event = Self::new(release);
        event.updated_paths.insert(release.root.clone());
        event
    }

    /// Event between two content listings of `release`, matching items by
    /// history so a changed path is reported as a move.
    pub fn between(
        release: &Release,
        before: &[ReleasedVersionable],
        after: &[ReleasedVersionable],
    ) -> Result<Self> {
        let mut event = Self::new(release);
        let active = |items: &[ReleasedVersionable]| -> HashMap<HistoryId, String> {
            items
                .iter()
                .filter(|i| i.active && !i.is_removal())
                .filter_map(|i| i.history_id.map(|h| (h, i.relative_path.clone())))
                .collect()
        };
        let old = active(before);
        let versions: HashMap<HistoryId, _> = before
            .iter()
            .filter_map(|i| i.history_id.map(|h| (h, i.version_id)))
            .collect();
        let new = active(after);

        for item in before {
            let Some(h) = item.history_id else { continue };
            if let Some(from) = old.get(&h) {
                if !new.contains_key(&h) && *from == item.relative_path {
                    event.add_move_or_update(Some(from.as_str()), None)?;
                }
            }
        }
        for item in after {
            let Some(h) = item.history_id else { continue };
            let Some(to) = new.get(&h) else { continue };
            if *to != item.relative_path {
                continue;
            }
            match old.get(&h) {
                None => event.add_move_or_update(None, Some(to.as_str()))?,
                Some(from) if from != to => {
                    event.add_move_or_update(Some(from.as_str()), Some(to.as_str()))?
                }
                Some(_) if versions.get(&h) != Some(&item.version_id) => {
                    event.add_move_or_update(Some(to.as_str()), Some(to.as_str()))?
                }
                Some(_) => {}
            }
        }
        Ok(event)
    }

    /// Record one change report. `None` for `from` means the path appeared,
    /// `None` for `to` that it disappeared, equal paths an in-place update.
    /// Relative paths are taken relative to the release root; paths in
    /// the workspace copy are mapped back to the release root.
    pub fn add_move_or_update(&mut self, from: Option<&str>, to: Option<&str>) -> Result<()> {
        self.check_open()?;
        let from = from.map(|p| self.live_path(p)).transpose()?;
        let to = to.map(|p| self.live_path(p)).transpose()?;
        match (from, to) {
            (Some(from), Some(to)) if from == to => {
                if !covers(&self.new_paths, &to) {
                    add_path(&mut self.updated_paths, to);
                }
            }
            (Some(from), Some(to)) => {
                self.moved_paths.insert(from, to);
            }
            (Some(from), None) => add_path(&mut self.removed_paths, from),
            (None, Some(to)) => add_path(&mut self.new_paths, to),
            (None, None) => {
                return Err(ReleaseError::validation(
                    "change report needs a from or a to path",
                ))
            }
        }
        Ok(())
    }

    fn live_path(&self, reported: &str) -> Result<String> {
        let joined = if reported.starts_with('/') {
            reported.to_string()
        } else {
            path::join(&self.release_root, reported)
        };
        let abs = path::normalize(&joined).ok_or_else(|| {
            ReleaseError::validation(format!("change path {reported:?} leaves the store root"))
        })?;
        Ok(match path::relative_to(&self.workspace_copy, &abs) {
            Some(rel) => path::join(&self.release_root, rel),
            None => abs,
        })
    }

    /// Tell consumers to drop incremental state and re-derive everything.
    pub fn set_force_full_check(&mut self) -> Result<()> {
        self.check_open()?;
        self.force_full_check = true;
        Ok(())
    }

    /// Freeze the event; later mutation fails.
    pub fn finish(&mut self) {
        self.finalized = true;
    }

    fn check_open(&self) -> Result<()> {
        if self.finalized {
            Err(ReleaseError::EventFinalized)
        } else {
            Ok(())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_paths.is_empty()
            && self.updated_paths.is_empty()
            && self.removed_paths.is_empty()
            && self.moved_paths.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn force_full_check(&self) -> bool {
        self.force_full_check
    }

    pub fn release_number(&self) -> &str {
        &self.release_number
    }

    pub fn release_root(&self) -> &str {
        &self.release_root
    }

    pub fn new_paths(&self) -> &IndexSet<String> {
        &self.new_paths
    }

    pub fn updated_paths(&self) -> &IndexSet<String> {
        &self.updated_paths
    }

    pub fn removed_paths(&self) -> &IndexSet<String> {
        &self.removed_paths
    }

    pub fn moved_paths(&self) -> &IndexMap<String, String> {
        &self.moved_paths
    }

    /// New paths plus move destinations
    pub fn new_or_moved(&self) -> IndexSet<String> {
        let mut out = self.new_paths.clone();
        out.extend(self.moved_paths.values().cloned());
        out
    }

    /// Removed paths plus move sources
    pub fn removed_or_moved(&self) -> IndexSet<String> {
        let mut out = self.removed_paths.clone();
        out.extend(self.moved_paths.keys().cloned());
        out
    }
}

fn covers(set: &IndexSet<String>, candidate: &str) -> bool {
    set.iter()
        .any(|p| path::is_same_or_descendant(p, candidate))
}

/// Insert keeping `set` ancestor-free
fn add_path(set: &mut IndexSet<String>, candidate: String) {
    if covers(set, &candidate) {
        return;
    }
    set.retain(|p| !path::is_same_or_descendant(&candidate, p));
    set.insert(candidate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

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

    fn set(items: &[&str]) -> IndexSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classifies_reports() {
        let mut ev = ChangeEvent::new(&release());
        ev.add_move_or_update(None, Some("a/new")).unwrap();
        ev.add_move_or_update(Some("a/doc"), Some("a/doc")).unwrap();
        ev.add_move_or_update(Some("a/gone"), None).unwrap();
        ev.add_move_or_update(Some("a/x"), Some("b/x")).unwrap();
        assert_eq!(ev.new_paths(), &set(&["/site/a/new"]));
        assert_eq!(ev.updated_paths(), &set(&["/site/a/doc"]));
        assert_eq!(ev.removed_paths(), &set(&["/site/a/gone"]));
        assert_eq!(ev.moved_paths().get("/site/a/x").map(String::as_str), Some("/site/b/x"));
        assert_eq!(ev.new_or_moved(), set(&["/site/a/new", "/site/b/x"]));
        assert_eq!(ev.removed_or_moved(), set(&["/site/a/gone", "/site/a/x"]));
    }

    #[test]
    fn test_descendant_dropped_ancestor_replaces() {
        let mut ev = ChangeEvent::new(&release());
        ev.add_move_or_update(None, Some("/site/a/b/c")).unwrap();
        ev.add_move_or_update(None, Some("/site/a/b/d")).unwrap();
        ev.add_move_or_update(None, Some("/site/a/b")).unwrap();
        ev.add_move_or_update(None, Some("/site/a/b/e")).unwrap();
        assert_eq!(ev.new_paths(), &set(&["/site/a/b"]));
    }

    #[test]
    fn test_update_of_new_path_stays_new() {
        let mut ev = ChangeEvent::new(&release());
        ev.add_move_or_update(None, Some("a")).unwrap();
        ev.add_move_or_update(Some("a/doc"), Some("a/doc")).unwrap();
        assert!(ev.updated_paths().is_empty());
    }

    #[test]
    fn test_empty_report_rejected() {
        let mut ev = ChangeEvent::new(&release());
        assert!(ev.add_move_or_update(None, None).is_err());
        assert!(ev.is_empty());
    }

    #[test]
    fn test_paths_are_normalized() {
        let mut ev = ChangeEvent::new(&release());
        ev.add_move_or_update(None, Some("a")).unwrap();
        ev.add_move_or_update(None, Some("b/../a/x")).unwrap();
        ev.add_move_or_update(Some("/site/./c//d/"), Some("/site/c/d")).unwrap();
        assert_eq!(ev.new_paths(), &set(&["/site/a"]));
        assert_eq!(ev.updated_paths(), &set(&["/site/c/d"]));
        assert!(ev.moved_paths().is_empty());
        assert!(ev.add_move_or_update(None, Some("/..")).unwrap_err().is_per_item());
    }

    #[test]
    fn test_workspace_copy_paths_map_to_root() {
        let mut ev = ChangeEvent::new(&release());
        ev.add_move_or_update(None, Some("/site/meta/releases/r1/root/a/doc"))
            .unwrap();
        ev.add_move_or_update(Some("/site/meta/releases/r1/root/b"), None)
            .unwrap();
        assert_eq!(ev.new_paths(), &set(&["/site/a/doc"]));
        assert_eq!(ev.removed_paths(), &set(&["/site/b"]));
    }

    #[test]
    fn test_finalized_event_is_immutable() {
        let mut ev = ChangeEvent::new(&release());
        ev.add_move_or_update(None, Some("a")).unwrap();
        ev.finish();
        assert!(matches!(
            ev.add_move_or_update(None, Some("b")),
            Err(ReleaseError::EventFinalized)
        ));
        assert!(matches!(ev.set_force_full_check(), Err(ReleaseError::EventFinalized)));
        assert!(!ev.force_full_check());
        assert_eq!(ev.new_paths().len(), 1);
    }

    #[test]
    fn test_full_update() {
        let ev = ChangeEvent::full_update(&release());
        assert_eq!(ev.updated_paths(), &set(&["/site"]));
        assert!(!ev.is_finalized());
    }

    #[test]
    fn test_between_distinguishes_moves() {
        let (h1, h2, h3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (v1, v2) = (Uuid::new_v4(), Uuid::new_v4());
        let before = vec![
            ReleasedVersionable::new("a/doc", None, Some(v1), Some(h1)),
            ReleasedVersionable::new("a/other", None, Some(v1), Some(h2)),
        ];
        let after = vec![
            ReleasedVersionable::new("b/doc", None, Some(v1), Some(h1)),
            ReleasedVersionable::new("a/other", None, Some(v2), Some(h2)),
            ReleasedVersionable::new("c/fresh", None, Some(v2), Some(h3)),
        ];
        let ev = ChangeEvent::between(&release(), &before, &after).unwrap();
        assert_eq!(
            ev.moved_paths().get("/site/a/doc").map(String::as_str),
            Some("/site/b/doc")
        );
        assert_eq!(ev.updated_paths(), &set(&["/site/a/other"]));
        assert_eq!(ev.new_paths(), &set(&["/site/c/fresh"]));
        assert!(ev.removed_paths().is_empty());
    }

    #[test]
    fn test_between_deactivation_is_removal() {
        let h = Uuid::new_v4();
        let v = Uuid::new_v4();
        let before = vec![ReleasedVersionable::new("a/doc", None, Some(v), Some(h))];
        let after = vec![before[0].clone().with_active(false)];
        let ev = ChangeEvent::between(&release(), &before, &after).unwrap();
        assert_eq!(ev.removed_paths(), &set(&["/site/a/doc"]));
        let back = ChangeEvent::between(&release(), &after, &before).unwrap();
        assert_eq!(back.new_paths(), &set(&["/site/a/doc"]));
    }
}
