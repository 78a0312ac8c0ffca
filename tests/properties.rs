//! Property tests for sibling reconciliation and change events.

use proptest::prelude::*;

use alice_release::path::{is_same_or_descendant, normalize};
use alice_release::{
    reconcile, reorder, ChangeEvent, ContentStore, MemoryStore, NodeKind, OrderResult, Release,
};
use indexmap::IndexSet;
use uuid::Uuid;

const UNIVERSE: [&str; 8] = ["a", "b", "c", "d", "e", "f", "g", "h"];

/// Unique sibling names in random order
fn siblings() -> impl Strategy<Value = Vec<String>> {
    proptest::sample::subsequence(UNIVERSE.to_vec(), 0..=UNIVERSE.len())
        .prop_shuffle()
        .prop_map(|names| names.into_iter().map(String::from).collect())
}

/// Paths around the release root, some relative, some with `..` segments
fn change_path() -> impl Strategy<Value = String> {
    (
        any::<bool>(),
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c", ".."]), 1..=4),
    )
        .prop_map(|(absolute, segments)| {
            let rel = segments.join("/");
            if absolute {
                format!("/site/{rel}")
            } else {
                rel
            }
        })
}

fn report() -> impl Strategy<Value = (Option<String>, Option<String>)> {
    (
        prop::option::of(change_path()),
        prop::option::of(change_path()),
    )
}

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

fn assert_ancestor_free(set: &IndexSet<String>) -> Result<(), TestCaseError> {
    for a in set {
        let normalized = normalize(a);
        prop_assert_eq!(normalized.as_deref(), Some(a.as_str()));
        for b in set {
            if a != b {
                prop_assert!(
                    !is_same_or_descendant(a, b),
                    "{} covers {} in {:?}",
                    a,
                    b,
                    set
                );
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn p4_reorder_is_idempotent(
        source in siblings(),
        destination in siblings(),
        pick in any::<prop::sample::Index>(),
    ) {
        prop_assume!(!destination.is_empty());
        let node = pick.get(&destination).clone();
        let first = reorder(&source, &node, &destination);

        let mut before = destination.clone();
        let mut after = first.ordering.clone();
        before.sort();
        after.sort();
        prop_assert_eq!(before, after);

        let second = reorder(&source, &node, &first.ordering);
        prop_assert_eq!(second.result, OrderResult::Unchanged);
        prop_assert_eq!(second.ordering, first.ordering);
    }

    #[test]
    fn p4_reconcile_is_idempotent_in_store(
        source in siblings(),
        destination in siblings(),
        pick in any::<prop::sample::Index>(),
    ) {
        prop_assume!(!destination.is_empty());
        let node = pick.get(&destination).clone();
        let mut store = MemoryStore::new();
        for (parent, children) in [("/live", &source), ("/copy", &destination)] {
            store.ensure_node(parent, NodeKind::Folder).unwrap();
            for name in children {
                store.create_node(&format!("{parent}/{name}"), NodeKind::Folder).unwrap();
            }
        }
        reconcile(&mut store, "/live", "/copy", &node).unwrap();
        let settled = store.children("/copy").unwrap();
        prop_assert_eq!(
            reconcile(&mut store, "/live", "/copy", &node).unwrap(),
            OrderResult::Unchanged
        );
        prop_assert_eq!(store.children("/copy").unwrap(), settled);
    }

    #[test]
    fn p5_change_sets_stay_ancestor_free(reports in prop::collection::vec(report(), 0..40)) {
        let mut event = ChangeEvent::new(&release());
        for (from, to) in &reports {
            // (None, None) and paths above the store root are rejected
            // and leave the event as it was
            let _ = event.add_move_or_update(from.as_deref(), to.as_deref());
        }
        assert_ancestor_free(event.new_paths())?;
        assert_ancestor_free(event.updated_paths())?;
        assert_ancestor_free(event.removed_paths())?;
    }
}
