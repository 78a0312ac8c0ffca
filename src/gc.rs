//! Mark-sweep collection of release labels
//!
//! A `release-<number>` label is live while the release of that number
//! still references the history. Labels on the candidate histories that
//! no live release accounts for are removed.
//!
//! Author: Moroya Sakamoto

use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::release::{references, Release, LABEL_PREFIX};
use crate::store::{ContentStore, HistoryId};

// ── GC Result ──────────────────────────────────────────────────────────

/// Statistics from a label collection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcResult {
    /// Release labels kept because a live release references them.
    pub retained: usize,
    /// Release labels removed.
    pub collected: usize,
    /// Release labels on the candidate histories before the run.
    pub total_before: usize,
}

impl GcResult {
    /// True if any labels were collected.
    #[inline]
    pub fn did_collect(&self) -> bool {
        self.collected > 0
    }
}

// ── Mark-Sweep ─────────────────────────────────────────────────────────

/// Remove `release-*` labels on `candidates` that no release in `live`
/// references.
///
/// # Algorithm
///
/// 1. **Mark**: every `(history, label)` pair of a reference in a live
///    release's workspace copy.
/// 2. **Sweep**: every release label on a candidate history not marked.
pub fn collect_labels<S: ContentStore + ?Sized>(
    store: &mut S,
    live: &[Release],
    candidates: &[HistoryId],
) -> Result<GcResult> {
    let reachable = mark(store, live)?;
    let labels = release_labels(store, candidates)?;
    let total_before = labels.len();

    let mut collected = 0;
    for (history, label) in labels {
        if !reachable.contains(&(history, label.clone())) {
            debug!(%history, label = %label, "collecting release label");
            store.remove_label(history, &label)?;
            collected += 1;
        }
    }

    Ok(GcResult {
        retained: total_before - collected,
        collected,
        total_before,
    })
}

/// Dry-run: compute what would be collected without removing anything.
pub fn dry_run<S: ContentStore + ?Sized>(
    store: &S,
    live: &[Release],
    candidates: &[HistoryId],
) -> Result<GcResult> {
    let reachable = mark(store, live)?;
    let labels = release_labels(store, candidates)?;
    let total_before = labels.len();
    let retained = labels.iter().filter(|l| reachable.contains(*l)).count();
    Ok(GcResult {
        retained,
        collected: total_before - retained,
        total_before,
    })
}

/// Histories referenced by the workspace copy of `release`
pub fn referenced_histories<S: ContentStore + ?Sized>(
    store: &S,
    release: &Release,
) -> Result<Vec<HistoryId>> {
    Ok(references(store, release)?
        .into_iter()
        .filter_map(|(_, item)| item.history_id)
        .collect())
}

fn mark<S: ContentStore + ?Sized>(
    store: &S,
    live: &[Release],
) -> Result<HashSet<(HistoryId, String)>> {
    let mut reachable = HashSet::new();
    for release in live {
        let label = release.label();
        for (_, item) in references(store, release)? {
            if let (Some(history), Some(_)) = (item.history_id, item.version_id) {
                reachable.insert((history, label.clone()));
            }
        }
    }
    Ok(reachable)
}

fn release_labels<S: ContentStore + ?Sized>(
    store: &S,
    candidates: &[HistoryId],
) -> Result<Vec<(HistoryId, String)>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for &history in candidates {
        if !seen.insert(history) {
            continue;
        }
        for (label, _) in store.labels(history)? {
            if label.starts_with(LABEL_PREFIX) {
                out.push((history, label));
            }
        }
    }
    Ok(out)
}

// ── Tests ──────────────────────────────────────────────────────────────
