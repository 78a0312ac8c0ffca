//! Sibling order reconciliation
//!
//! Keeps the child order of a release node consistent with the live
//! tree. Siblings are matched by name. Placement of a node is scored by
//! counting violated precedence constraints taken from the source order;
//! a placement with no violations is consistent, and when several are
//! consistent the first one wins and the result is flagged heuristic.
//! If the common siblings are in contradictory order the destination is
//! re-threaded: common siblings in source order, destination-only
//! siblings re-inserted where they best keep their former neighbours.
//!
//! Author: Moroya Sakamoto

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReleaseError, Result, StoreError};
use crate::store::ContentStore;

// ── Order Result ───────────────────────────────────────────────────────

/// Classification of a reconciliation, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderResult {
    /// Destination node type has no explicit child order
    NotOrderable,
    Unchanged,
    /// Exactly one consistent order existed
    DeterministicallyReordered,
    /// Several candidate orders existed; the first was taken
    HeuristicallyReordered,
}

impl OrderResult {
    /// The more severe of two results
    pub fn max(self, other: OrderResult) -> OrderResult {
        std::cmp::max(self, other)
    }

    /// True if the caller should look at the outcome
    pub fn is_reordered(self) -> bool {
        self >= OrderResult::DeterministicallyReordered
    }

    /// Merge `other` into `into`, keeping the more severe result per key.
    pub fn combine(into: &mut BTreeMap<String, OrderResult>, other: BTreeMap<String, OrderResult>) {
        for (path, result) in other {
            into.entry(path)
                .and_modify(|r| *r = OrderResult::max(*r, result))
                .or_insert(result);
        }
    }
}

/// Target sibling order and how it was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    pub result: OrderResult,
    pub ordering: Vec<String>,
}

// ── Relationships ──────────────────────────────────────────────────────

/// Siblings a node must follow and precede, taken from a reference order.
struct Relationships<'a> {
    predecessors: HashSet<&'a str>,
    successors: HashSet<&'a str>,
}

impl<'a> Relationships<'a> {
    fn new(node: &str, all: &[&'a str]) -> Self {
        match all.iter().position(|n| *n == node) {
            Some(pos) => Self {
                predecessors: all[..pos].iter().copied().collect(),
                successors: all[pos + 1..].iter().copied().collect(),
            },
            None => Self {
                predecessors: HashSet::new(),
                successors: HashSet::new(),
            },
        }
    }

    /// Constraints broken by inserting the node at `pos` of `nodes`
    fn violations(&self, nodes: &[&str], pos: usize) -> usize {
        let before = nodes[..pos]
            .iter()
            .filter(|n| self.successors.contains(*n))
            .count();
        let after = nodes[pos..]
            .iter()
            .filter(|n| self.predecessors.contains(*n))
            .count();
        before + after
    }

    /// Insert positions into `nodes` (with `node` itself removed) that break
    /// the fewest constraints, and that minimal count.
    fn best_positions(&self, node: &str, nodes: &[&str]) -> (Vec<usize>, usize) {
        let others: Vec<&str> = nodes.iter().copied().filter(|n| *n != node).collect();
        let mut best = Vec::new();
        let mut min = usize::MAX;
        for pos in 0..=others.len() {
            let v = self.violations(&others, pos);
            if v < min {
                min = v;
                best.clear();
            }
            if v == min {
                best.push(pos);
            }
        }
        (best, min)
    }
}

// ── Orderer ────────────────────────────────────────────────────────────

/// Compute the destination order for `node` so it tracks `source`.
pub fn reorder(source: &[String], node: &str, destination: &[String]) -> Ordering {
    let src: Vec<&str> = source.iter().map(String::as_str).collect();
    let dst: Vec<&str> = destination.iter().map(String::as_str).collect();

    let Some(current) = dst.iter().position(|n| *n == node) else {
        return unchanged(destination);
    };
    let relationships = Relationships::new(node, &src);
    let (best, min) = relationships.best_positions(node, &dst);
    if min > 0 {
        return rethread(&src, &dst);
    }

    let mut others: Vec<&str> = dst.iter().copied().filter(|n| *n != node).collect();
    if best.len() == 1 {
        others.insert(best[0], node);
        let result = if others == dst {
            OrderResult::Unchanged
        } else {
            OrderResult::DeterministicallyReordered
        };
        return Ordering {
            result,
            ordering: owned(&others),
        };
    }
    if best.contains(&current) {
        return unchanged(destination);
    }
    others.insert(best[0], node);
    Ordering {
        result: OrderResult::HeuristicallyReordered,
        ordering: owned(&others),
    }
}

/// Common siblings in source order, destination-only siblings re-inserted
/// one at a time, always picking one with a unique best position first.
fn rethread(src: &[&str], dst: &[&str]) -> Ordering {
    let mut result = OrderResult::DeterministicallyReordered;
    let mut ordering: Vec<&str> = src.iter().copied().filter(|n| dst.contains(n)).collect();
    let mut missing: Vec<&str> = dst
        .iter()
        .copied()
        .filter(|n| !ordering.contains(n))
        .collect();

    while !missing.is_empty() {
        let unique = missing.iter().enumerate().find_map(|(i, m)| {
            let (best, min) = Relationships::new(m, dst).best_positions(m, &ordering);
            (best.len() == 1).then(|| (i, best[0], min))
        });
        match unique {
            Some((i, pos, min)) => {
                if min > 0 {
                    result = OrderResult::HeuristicallyReordered;
                }
                let m = missing.remove(i);
                ordering.insert(pos, m);
            }
            None => {
                result = OrderResult::HeuristicallyReordered;
                let m = missing.remove(0);
                let (best, _) = Relationships::new(m, dst).best_positions(m, &ordering);
                ordering.insert(best.first().copied().unwrap_or(ordering.len()), m);
            }
        }
    }
    Ordering {
        result,
        ordering: owned(&ordering),
    }
}

fn unchanged(destination: &[String]) -> Ordering {
    Ordering {
        result: OrderResult::Unchanged,
        ordering: destination.to_vec(),
    }
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ── Store Application ──────────────────────────────────────────────────

/// Reorder the children of `dest_parent` around `node` to track the
/// children of `source_parent`.
pub fn reconcile<S: ContentStore + ?Sized>(
    store: &mut S,
    source_parent: &str,
    dest_parent: &str,
    node: &str,
) -> Result<OrderResult> {
    let dest = store.require(dest_parent)?;
    if !dest.kind.is_orderable() {
        return Ok(OrderResult::NotOrderable);
    }
    let source = store.children(source_parent)?;
    let current = store.children(dest_parent)?;
    let target = reorder(&source, node, &current);
    if target.result > OrderResult::Unchanged {
        debug!(
            parent = dest_parent,
            node,
            result = ?target.result,
            "reordering release siblings"
        );
        apply_order(store, dest_parent, &target.ordering)?;
    }
    Ok(target.result)
}

/// Move children of `parent` to the end one by one in `ordering`, then
/// verify the observed order.
pub fn apply_order<S: ContentStore + ?Sized>(
    store: &mut S,
    parent: &str,
    ordering: &[String],
) -> Result<()> {
    let current = store.children(parent)?;
    if current.len() != ordering.len() {
        return Err(ReleaseError::validation(format!(
            "cannot order {parent}: {} children but target has {}",
            current.len(),
            ordering.len()
        )));
    }
    if current == ordering {
        return Ok(());
    }
    for name in ordering {
        store.order_before(parent, name, None)?;
    }
    let observed = store.children(parent)?;
    if observed != ordering {
        return Err(StoreError::Invalid(format!("order of {parent} did not converge")).into());
    }
    Ok(())
}
