//! ALICE-Release: Release Staging
//!
//! Named releases of a versioned content tree, served as if each were
//! the live tree.
//!
//! A release root owns a set of releases. Each release keeps a
//! workspace copy mirroring the live tree, with every versionable
//! replaced by a reference to one immutable snapshot:
//! - Path resolution through a release into frozen snapshots
//! - Sibling order reconciliation with deterministic/heuristic results
//! - Ancestor-free change events for replication
//! - Marks, numbering and the previous-release chain
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`change`] | Minimal change events (new, updated, removed, moved) |
//! | [`config`] | Staging configuration: overlay, exclusions, storage path |
//! | [`error`] | Error taxonomy |
//! | [`gc`] | Mark-sweep collection of orphaned release labels |
//! | [`memory`] | In-memory content store |
//! | [`number`] | Release numbering policies and comparator |
//! | [`order`] | Sibling order reconciliation |
//! | [`path`] | Store path helpers |
//! | [`publish`] | Synchronous delivery of change events to listeners |
//! | [`registry`] | Release lifecycle and the release write path |
//! | [`release`] | Release and released-versionable model |
//! | [`resolver`] | Read-only resolution of paths through a release |
//! | [`store`] | Content store abstraction |
//! | [`sync`] | Tree synchronization with version references |
//! | [`tree`] | Arena node tree backing the in-memory store |
//!
//! # Quick Start
//!
//! ```
//! use alice_release::{
//!     ContentStore, MemoryStore, NodeKind, ReleaseBump, ReleaseRegistry, ReleasedVersionable,
//! };
//!
//! // A live tree with one checked-in document
//! let mut store = MemoryStore::new();
//! store.ensure_node("/site/a", NodeKind::Folder).unwrap();
//! store.create_node("/site/a/doc", NodeKind::Versionable).unwrap();
//! let v1 = store.checkpoint("/site/a/doc").unwrap();
//!
//! // Pin it into the current release, then cut r1
//! let mut registry = ReleaseRegistry::new(store);
//! let current = registry.ensure_current("/site").unwrap();
//! let item = ReleasedVersionable::new(
//!     "a/doc", Some(v1.versionable_id), Some(v1.id), Some(v1.history_id),
//! );
//! registry.update_release_item(&current, &item).unwrap();
//! let r1 = registry.create_release(&current, &ReleaseBump::Major).unwrap();
//! assert_eq!(r1.number, "r1");
//!
//! // Seen through r1 the document is the frozen snapshot
//! let resolver = registry.resolver(&r1);
//! let doc = resolver.resolve("/site/a/doc").unwrap();
//! assert_eq!(doc.version(), Some(v1.id));
//! ```
//!
//! Author: Moroya Sakamoto

pub mod change;
pub mod config;
pub mod error;
pub mod gc;
pub mod memory;
pub mod number;
pub mod order;
pub mod path;
pub mod publish;
pub mod registry;
pub mod release;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod tree;

pub use change::ChangeEvent;
pub use config::StagingConfig;
pub use error::{ListenerError, ReleaseError, Result, StoreError, StoreResult};
pub use gc::{collect_labels, dry_run, GcResult};
pub use memory::MemoryStore;
pub use number::{compare_numbers, NumberPolicy, ReleaseBump, CURRENT_RELEASE};
pub use order::{reconcile, reorder, OrderResult, Ordering};
pub use publish::{ChangeListener, ChangePublisher};
pub use registry::{ItemFailure, ReleaseRegistry, UpdateOutcome};
pub use release::{Release, ReleaseId, ReleasedVersionable};
pub use resolver::{MapAll, ReleaseMapper, ReleaseResolver, Resolved};
pub use store::{
    AttrValue, ContentStore, HistoryId, NodeData, NodeKind, SnapshotInfo, VersionId,
    VersionableId,
};
pub use sync::{SyncStats, TreeSynchronizer};
pub use tree::{NodeId, NodeTree, TreeNode};
