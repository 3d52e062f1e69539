//! File and directory snapshots for Keel's up-to-date checks.
//!
//! The pipeline is split in two so unchanged reruns never read file contents:
//!
//! 1. [`Snapshotter::precheck`] walks the declared [`FileSet`] (through the
//!    [`TreeScanCache`]) and produces a [`PreCheck`]: raw paths plus length and
//!    modification time, summarized by an order-independent structural hash.
//! 2. [`Snapshotter::snapshot`] hashes the regular files recorded in a precheck and
//!    produces an immutable [`SnapshotCollection`].
//!
//! Collections are sorted by path, so [`SnapshotCollection::diff`] is a single
//! merge walk and a [`ChangeSet`] can be applied to a third collection, reusing
//! every untouched entry.

mod collection;
mod diff;
mod eligibility;
mod error;
mod file_set;
mod hasher;
mod precheck;
mod snapshot;
mod snapshotter;
mod storage_id;
mod tree;
mod tree_cache;

pub use collection::SnapshotCollection;
pub use diff::{ChangeKind, ChangeSet, DiffChanges, FileChange, MergeStep, MergeWalk, SnapshotDiff};
pub use eligibility::{TreeCachePlan, WorkNode};
pub use error::{Result, SnapshotError};
pub use file_set::{FileRoot, FileSet, PatternSet};
pub use hasher::{Blake3FileHasher, FileHasher};
pub use precheck::PreCheck;
pub use snapshot::{CompareMode, ContentHash, FileMetadata, Snapshot};
pub use snapshotter::{FileCollectionSnapshot, Snapshotter};
pub use storage_id::StorageId;
pub use tree::{ElementKind, FileTreeElement, VisitedTree};
pub use tree_cache::{TreeCacheStats, TreeScanCache};
