//! End-to-end release staging scenarios over the in-memory store.

use std::cell::RefCell;
use std::rc::Rc;

use alice_release::order::apply_order;
use alice_release::{
    reconcile, reorder, AttrValue, ChangeEvent, ChangeListener, ChangePublisher, ContentStore,
    ListenerError, MemoryStore, NodeKind, OrderResult, ReleaseBump, ReleaseRegistry,
    ReleasedVersionable, SnapshotInfo, StagingConfig,
};

const ROOT: &str = "/site";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> ReleaseRegistry<MemoryStore> {
    init_tracing();
    let mut store = MemoryStore::new();
    store.ensure_node(ROOT, NodeKind::Folder).unwrap();
    ReleaseRegistry::new(store)
}

/// Create and check in a versionable with a `body` child
fn document(reg: &mut ReleaseRegistry<MemoryStore>, rel: &str) -> SnapshotInfo {
    let abs = format!("{ROOT}/{rel}");
    let store = reg.store_mut();
    store.ensure_node(&abs, NodeKind::Versionable).unwrap();
    store
        .create_node(&format!("{abs}/body"), NodeKind::Folder)
        .unwrap();
    store.checkpoint(&abs).unwrap()
}

fn pinned(rel: &str, snap: &SnapshotInfo) -> ReleasedVersionable {
    ReleasedVersionable::new(
        rel,
        Some(snap.versionable_id),
        Some(snap.id),
        Some(snap.history_id),
    )
}

fn names(s: &str) -> Vec<String> {
    s.chars().map(|c| c.to_string()).collect()
}

// ── Scenarios ──────────────────────────────────────────────────────────

#[test]
fn scenario_a_fresh_root() {
    let mut reg = registry();
    let releases = reg.releases(ROOT).unwrap();
    assert_eq!(releases.len(), 1);
    let current = &releases[0];
    assert!(current.is_current());
    assert!(reg.list_release_contents(current).unwrap().is_empty());

    let r1 = reg.create_release(current, &ReleaseBump::Major).unwrap();
    assert_eq!(r1.number, "r1");
}

#[test]
fn scenario_b_pin_versionable() {
    let mut reg = registry();
    let v1 = document(&mut reg, "a/doc");
    let current = reg.ensure_current(ROOT).unwrap();
    let r1 = reg.create_release(&current, &ReleaseBump::Major).unwrap();

    let outcome = reg.update_release(&r1, &[pinned("a/doc", &v1)]).unwrap();
    assert!(outcome.is_complete());

    let contents = reg.list_release_contents(&r1).unwrap();
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].relative_path, "a/doc");
    assert_eq!(contents[0].version_id, Some(v1.id));
    assert_eq!(
        reg.store().resolve_label(v1.history_id, "release-r1").unwrap(),
        Some(v1.id)
    );
}

#[test]
fn scenario_c_move_keeps_identity() {
    let mut reg = registry();
    let v1 = document(&mut reg, "a/doc");
    let current = reg.ensure_current(ROOT).unwrap();
    reg.update_release_item(&current, &pinned("a/doc", &v1))
        .unwrap();
    let r1 = reg.create_release(&current, &ReleaseBump::Major).unwrap();

    reg.store_mut()
        .ensure_node("/site/b/c", NodeKind::Folder)
        .unwrap();
    reg.store_mut()
        .move_subtree("/site/a/doc", "/site/b/c/doc")
        .unwrap();
    let moved = ReleasedVersionable::from_live(reg.store(), ROOT, "/site/b/c/doc")
        .unwrap()
        .unwrap();
    let outcome = reg.update_release(&current, &[moved]).unwrap();
    assert_eq!(
        outcome.event.moved_paths().get("/site/a/doc").map(String::as_str),
        Some("/site/b/c/doc")
    );

    let copy = current.workspace_copy();
    assert!(!reg.store().exists(&format!("{copy}/a")).unwrap());
    let now = reg
        .find_released_versionable(&current, "b/c/doc")
        .unwrap()
        .unwrap();
    assert_eq!(now.versionable_id, Some(v1.versionable_id));
    assert_eq!(now.history_id, Some(v1.history_id));

    let current_view = reg.resolver(&current);
    assert!(current_view.resolve("/site/a/doc").is_none());
    assert!(current_view.resolve("/site/a").is_none());
    assert_eq!(
        current_view.resolve("/site/b/c/doc").unwrap().version(),
        Some(v1.id)
    );

    let older = reg.resolver(&r1);
    let doc = older.resolve("/site/a/doc").unwrap();
    assert!(doc.is_frozen());
    assert_eq!(doc.version(), Some(v1.id));
    assert!(older.resolve("/site/a/doc/body").is_some());
}

#[test]
fn scenario_d_heuristic_reorder() {
    let got = reorder(&names("abc"), "b", &names("baijc"));
    assert_eq!(got.result, OrderResult::HeuristicallyReordered);
    assert_eq!(got.ordering, names("abijc"));

    let mut store = MemoryStore::new();
    for (parent, children) in [("/live", "abc"), ("/copy", "baijc")] {
        store.ensure_node(parent, NodeKind::Folder).unwrap();
        for name in names(children) {
            store
                .create_node(&format!("{parent}/{name}"), NodeKind::Folder)
                .unwrap();
        }
    }
    let result = reconcile(&mut store, "/live", "/copy", "b").unwrap();
    assert_eq!(result, OrderResult::HeuristicallyReordered);
    assert_eq!(store.children("/copy").unwrap(), names("abijc"));
    // second pass has nothing left to do
    assert_eq!(
        reconcile(&mut store, "/live", "/copy", "b").unwrap(),
        OrderResult::Unchanged
    );
}

#[test]
fn scenario_d_unordered_parent() {
    let mut store = MemoryStore::new();
    store.ensure_node("/live/a", NodeKind::Folder).unwrap();
    store
        .ensure_node("/copy", NodeKind::UnorderedFolder)
        .unwrap();
    store.create_node("/copy/a", NodeKind::Folder).unwrap();
    assert_eq!(
        reconcile(&mut store, "/live", "/copy", "a").unwrap(),
        OrderResult::NotOrderable
    );
    assert!(apply_order(&mut store, "/copy", &names("ab")).is_err());
}

#[test]
fn scenario_e_deactivate_then_reactivate() {
    let mut reg = registry();
    let v1 = document(&mut reg, "a/doc");
    let current = reg.ensure_current(ROOT).unwrap();
    reg.update_release_item(&current, &pinned("a/doc", &v1))
        .unwrap();

    let outcome = reg
        .update_release(&current, &[pinned("a/doc", &v1).with_active(false)])
        .unwrap();
    assert!(outcome.event.removed_paths().contains("/site/a/doc"));
    assert!(reg.resolver(&current).resolve("/site/a/doc").is_none());

    reg.store_mut()
        .set_attribute("/site/a/doc", "title", Some(AttrValue::Text("v2".into())))
        .unwrap();
    let v2 = reg.store_mut().checkpoint("/site/a/doc").unwrap();
    assert_ne!(v1.id, v2.id);

    let outcome = reg.update_release(&current, &[pinned("a/doc", &v2)]).unwrap();
    assert!(outcome.event.new_paths().contains("/site/a/doc"));
    let view = reg.resolver(&current);
    let doc = view.resolve("/site/a/doc").unwrap();
    assert_eq!(doc.version(), Some(v2.id));
    assert_eq!(doc.attribute("title"), Some(&AttrValue::Text("v2".into())));
    assert_eq!(
        reg.store().resolve_label(v1.history_id, "release-current").unwrap(),
        Some(v2.id)
    );
}

// ── Properties ─────────────────────────────────────────────────────────

#[test]
fn p1_paths_without_indirection_match_live() {
    let mut reg = registry();
    let v1 = document(&mut reg, "a/doc");
    reg.store_mut()
        .set_attribute("/site/a", "title", Some(AttrValue::Text("Section".into())))
        .unwrap();
    reg.store_mut()
        .ensure_node("/site/assets/logo", NodeKind::Folder)
        .unwrap();
    reg.store_mut()
        .ensure_node("/other/page", NodeKind::Folder)
        .unwrap();
    let current = reg.ensure_current(ROOT).unwrap();
    reg.update_release_item(&current, &pinned("a/doc", &v1))
        .unwrap();

    let view = reg.resolver(&current);
    for p in ["/site/a", "/site/assets/logo", "/other/page"] {
        let resolved = view.resolve(p).unwrap();
        assert!(!resolved.is_frozen(), "{p}");
        assert_eq!(
            resolved.attributes(),
            reg.store().require(p).unwrap().attributes,
            "{p}"
        );
    }
    let title = view.resolve("/site/a/title").unwrap();
    assert_eq!(title.value(), Some(&AttrValue::Text("Section".into())));
    // release storage never shows through a release
    assert!(view.resolve("/site/meta/releases").is_none());
    assert!(view.resolve("/site/../..").is_none());
    assert!(view.resolve("site/a").is_none());
}

#[test]
fn p2_deactivation_hides_subtree() {
    let mut reg = registry();
    let doc = document(&mut reg, "a/doc");
    let other = document(&mut reg, "a/other");
    let current = reg.ensure_current(ROOT).unwrap();
    reg.update_release(&current, &[pinned("a/doc", &doc), pinned("a/other", &other)])
        .unwrap();

    {
        let view = reg.resolver(&current);
        assert!(view.resolve("/site/a/doc/body").is_some());
        let folder = view.resolve("/site/a").unwrap();
        let listed: Vec<String> = view
            .list_children(&folder)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(listed, vec!["doc", "other"]);
    }

    reg.update_release_item(&current, &pinned("a/doc", &doc).with_active(false))
        .unwrap();
    let view = reg.resolver(&current);
    assert!(view.resolve("/site/a/doc").is_none());
    assert!(view.resolve("/site/a/doc/body").is_none());
    let folder = view.resolve("/site/a").unwrap();
    let listed: Vec<String> = view
        .list_children(&folder)
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    assert_eq!(listed, vec!["other"]);

    let root = view.resolve(ROOT).unwrap();
    let top: Vec<String> = view
        .list_children(&root)
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    assert_eq!(top, vec!["meta", "a"]);
}

#[test]
fn p3_one_label_per_history() {
    let mut reg = registry();
    let v1 = document(&mut reg, "a/doc");
    let current = reg.ensure_current(ROOT).unwrap();
    reg.update_release_item(&current, &pinned("a/doc", &v1))
        .unwrap();

    let mut latest = v1.clone();
    for i in 0..3 {
        reg.store_mut()
            .set_attribute("/site/a/doc", "rev", Some(AttrValue::Int(i)))
            .unwrap();
        latest = reg.store_mut().checkpoint("/site/a/doc").unwrap();
        reg.update_release_item(&current, &pinned("a/doc", &latest))
            .unwrap();
        let labelled: Vec<_> = reg
            .store()
            .labels(v1.history_id)
            .unwrap()
            .into_iter()
            .filter(|(label, _)| label == "release-current")
            .collect();
        assert_eq!(labelled.len(), 1);
        let reference = reg
            .find_released_versionable(&current, "a/doc")
            .unwrap()
            .unwrap();
        assert_eq!(Some(labelled[0].1), reference.version_id);
    }
    assert_eq!(reg.store().versions(v1.history_id).len(), 4);

    reg.update_release_item(&current, &pinned("a/doc", &latest).removal())
        .unwrap();
    assert!(reg
        .store()
        .resolve_label(v1.history_id, "release-current")
        .unwrap()
        .is_none());
}

// ── Publication ────────────────────────────────────────────────────────

struct Collector(Rc<RefCell<Vec<ChangeEvent>>>);

impl ChangeListener for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    fn receive(&mut self, event: &ChangeEvent) -> Result<(), ListenerError> {
        self.0.borrow_mut().push(event.clone());
        Ok(())
    }
}

#[test]
fn update_events_reach_listeners() {
    let mut reg = registry();
    let v1 = document(&mut reg, "a/doc");
    let current = reg.ensure_current(ROOT).unwrap();
    let outcome = reg.update_release(&current, &[pinned("a/doc", &v1)]).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut publisher = ChangePublisher::new();
    publisher.register(Box::new(Collector(Rc::clone(&seen))));
    assert_eq!(publisher.publish(&outcome.event).unwrap(), 1);

    let events = seen.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].release_number(), "current");
    assert!(events[0].new_or_moved().contains("/site/a/doc"));
    let json = serde_json::to_string(&events[0]).unwrap();
    let back: ChangeEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back, events[0]);
}

#[test]
fn custom_release_storage() {
    init_tracing();
    let config = StagingConfig::from_json(
        r#"{"releases_path": "staging", "excluded_paths": ["staging"], "overlay_nodes": []}"#,
    )
    .unwrap();
    let mut store = MemoryStore::new();
    store.ensure_node(ROOT, NodeKind::Folder).unwrap();
    let mut reg = ReleaseRegistry::with_config(store, config).unwrap();
    let v1 = document(&mut reg, "doc");
    let current = reg.ensure_current(ROOT).unwrap();
    assert_eq!(current.node_path, "/site/staging/current");

    let (_, event) = reg.import_live_tree(&current).unwrap();
    assert!(event.new_paths().contains("/site/doc"));
    let r1 = reg.create_next_release(ROOT, &ReleaseBump::Major).unwrap();
    assert_eq!(
        reg.list_release_contents(&r1).unwrap(),
        vec![pinned("doc", &v1)]
    );
    assert!(reg.resolver(&r1).resolve("/site/staging").is_none());
}

#[test]
fn broken_reference_resolves_to_nothing() {
    let mut reg = registry();
    let v1 = document(&mut reg, "a/doc");
    let current = reg.ensure_current(ROOT).unwrap();
    reg.update_release_item(&current, &pinned("a/doc", &v1)).unwrap();
    assert!(reg.resolver(&current).resolve("/site/a/doc/body").is_some());

    let reference = format!("{}/a/doc", current.workspace_copy());
    reg.store_mut()
        .set_attribute(
            &reference,
            alice_release::release::ATTR_REF_VERSION,
            Some(AttrValue::Id(uuid::Uuid::new_v4())),
        )
        .unwrap();

    let resolver = reg.resolver(&current);
    assert!(resolver.resolve("/site/a/doc").is_none());
    assert!(resolver.resolve("/site/a/doc/body").is_none());
    assert!(resolver.resolve("/site/a").is_some());
}

#[test]
fn refused_paths_come_from_the_live_tree() {
    let mut reg = registry();
    let a = document(&mut reg, "a/doc");
    let b = document(&mut reg, "b/doc");
    let current = reg.ensure_current(ROOT).unwrap();
    reg.update_release(&current, &[pinned("a/doc", &a), pinned("b/doc", &b)])
        .unwrap();
    reg.store_mut()
        .set_attribute("/site/a/doc", "title", Some(AttrValue::Text("draft".into())))
        .unwrap();

    let live_only = |p: &str| !p.starts_with("/site/a");
    let resolver = reg.resolver(&current).with_mapper(&live_only);

    let doc = resolver.resolve("/site/a/doc").unwrap();
    assert!(!doc.is_frozen());
    assert!(matches!(
        &doc,
        alice_release::Resolved::Live { store_path, .. } if store_path == "/site/a/doc"
    ));
    assert_eq!(doc.attribute("title"), Some(&AttrValue::Text("draft".into())));

    let other = resolver.resolve("/site/b/doc").unwrap();
    assert!(other.is_frozen());
    assert_eq!(other.version(), Some(b.id));
}
