use std::path::Path;
use std::sync::Arc;

use keel_core::PathInterner;

use crate::collection::SnapshotCollection;
use crate::diff::{ChangeKind, ChangeSet, FileChange, MergeStep, MergeWalk};
use crate::error::{Result, SnapshotError};
use crate::file_set::{FileRoot, FileSet};
use crate::hasher::FileHasher;
use crate::precheck::PreCheck;
use crate::snapshot::Snapshot;
use crate::tree::{ElementKind, FileTreeElement};
use crate::tree_cache::TreeScanCache;

/// A hashed file collection together with the shareable tree collections it was assembled from.
///
/// Persistent stores write each shared tree once and reference it from every record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileCollectionSnapshot {
    pub collection: SnapshotCollection,
    pub shared_trees: Vec<SnapshotCollection>,
}

impl FileCollectionSnapshot {
    pub fn unshared(collection: SnapshotCollection) -> Self {
        Self {
            collection,
            shared_trees: Vec::new(),
        }
    }
}

impl From<SnapshotCollection> for FileCollectionSnapshot {
    fn from(collection: SnapshotCollection) -> Self {
        Self::unshared(collection)
    }
}

pub struct Snapshotter {
    interner: Arc<PathInterner>,
    hasher: Arc<dyn FileHasher>,
    tree_cache: Arc<TreeScanCache>,
}

impl Snapshotter {
    pub fn new(hasher: Arc<dyn FileHasher>, tree_cache: Arc<TreeScanCache>) -> Self {
        Self::with_interner(hasher, tree_cache, Arc::new(PathInterner::new()))
    }

    pub fn with_interner(
        hasher: Arc<dyn FileHasher>,
        tree_cache: Arc<TreeScanCache>,
        interner: Arc<PathInterner>,
    ) -> Self {
        Self {
            interner,
            hasher,
            tree_cache,
        }
    }

    pub fn interner(&self) -> &Arc<PathInterner> {
        &self.interner
    }

    pub fn tree_cache(&self) -> &Arc<TreeScanCache> {
        &self.tree_cache
    }

    /// Walks `files`, reusing cached tree walks where possible.
    pub fn precheck(&self, files: &FileSet) -> Result<PreCheck> {
        self.precheck_with(files, true)
    }

    /// Walks `files` from disk, refreshing the tree cache. Used for outputs right after a work
    /// item wrote them.
    pub fn precheck_fresh(&self, files: &FileSet) -> Result<PreCheck> {
        self.precheck_with(files, false)
    }

    fn precheck_with(&self, files: &FileSet, allow_reuse: bool) -> Result<PreCheck> {
        let mut trees = Vec::new();
        let mut loose = Vec::new();
        for root in files.roots() {
            let path = keel_core::absolute_path(root.path()).map_err(|err| SnapshotError::io(root.path(), err))?;
            match root {
                FileRoot::File(_) => loose.push(FileTreeElement::stat(&path, &self.interner)?),
                FileRoot::Tree { patterns, .. } => {
                    trees.push(self.tree_cache.visit(&path, patterns, allow_reuse, &self.interner)?)
                }
            }
        }
        Ok(PreCheck::new(trees, loose))
    }

    /// Hashes every regular file the precheck observed.
    ///
    /// Shareable trees are hashed at most once per walk, no matter how many work items observe
    /// them.
    pub fn snapshot(&self, precheck: &PreCheck) -> Result<FileCollectionSnapshot> {
        let mut parts = Vec::with_capacity(precheck.visited_trees().len() + 1);
        let mut shared_trees = Vec::new();
        for tree in precheck.visited_trees() {
            if tree.is_shareable() {
                let hashed = tree
                    .hashed_or_try_init(|| self.hash_elements(tree.entries().iter()))?
                    .clone();
                shared_trees.push(hashed.clone());
                parts.push(hashed);
            } else {
                parts.push(self.hash_elements(tree.entries().iter())?);
            }
        }
        parts.push(self.hash_elements(precheck.loose().iter())?);

        Ok(FileCollectionSnapshot {
            collection: SnapshotCollection::merge(parts),
            shared_trees,
        })
    }

    /// Builds the snapshot for `precheck` starting from `previous`, hashing only paths whose kind,
    /// length or modification time differ.
    pub fn snapshot_reusing(&self, precheck: &PreCheck, previous: &SnapshotCollection) -> Result<SnapshotCollection> {
        let mut elements: Vec<&FileTreeElement> = precheck.elements().collect();
        elements.sort_by(|a, b| a.path.cmp(&b.path));
        elements.dedup_by(|later, earlier| later.path == earlier.path);

        let mut changes = Vec::new();
        let mut to_hash = Vec::new();
        let walk = MergeWalk::new(
            elements.iter().map(|element| (&*element.path, *element)),
            previous.entries().iter().map(|entry| (&*entry.0, entry)),
        );
        for step in walk {
            match step {
                MergeStep::Current(_, element) => {
                    changes.push(FileChange::new(element.path.clone(), ChangeKind::Added));
                    to_hash.push(element);
                }
                MergeStep::Previous(_, (path, _)) => {
                    changes.push(FileChange::new(path.clone(), ChangeKind::Removed));
                }
                MergeStep::Both(_, element, (_, snapshot)) => {
                    if !metadata_matches(element, snapshot) {
                        changes.push(FileChange::new(element.path.clone(), ChangeKind::Changed));
                        to_hash.push(element);
                    }
                }
            }
        }

        if changes.is_empty() {
            return Ok(previous.clone());
        }
        tracing::trace!(
            target = "keel.snapshot",
            changed = changes.len(),
            rehashed = to_hash.len(),
            "reusing previous snapshot"
        );
        let delta = self.hash_elements(to_hash.into_iter())?;
        Ok(ChangeSet::from_changes(changes).apply_to(previous, &delta))
    }

    fn hash_elements<'a>(&self, elements: impl Iterator<Item = &'a FileTreeElement>) -> Result<SnapshotCollection> {
        let entries = elements
            .map(|element| -> Result<_> { Ok((element.path.clone(), self.hash_element(element)?)) })
            .collect::<Result<Vec<_>>>()?;
        Ok(SnapshotCollection::from_entries(entries))
    }

    fn hash_element(&self, element: &FileTreeElement) -> Result<Snapshot> {
        Ok(match element.kind {
            ElementKind::Missing => Snapshot::Missing,
            ElementKind::Directory => Snapshot::Directory,
            ElementKind::File => {
                let path = Path::new(&*element.path);
                let hash = self
                    .hasher
                    .hash(path, element.metadata)
                    .map_err(|err| SnapshotError::io(path, err))?;
                Snapshot::file(hash, element.metadata)
            }
        })
    }
}

fn metadata_matches(element: &FileTreeElement, snapshot: &Snapshot) -> bool {
    match (element.kind, snapshot) {
        (ElementKind::Missing, Snapshot::Missing) => true,
        (ElementKind::Directory, Snapshot::Directory) => true,
        (ElementKind::File, Snapshot::File { metadata, .. }) => element.metadata == *metadata,
        _ => false,
    }
}
