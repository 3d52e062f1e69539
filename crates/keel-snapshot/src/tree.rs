use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use keel_core::PathInterner;
use once_cell::sync::OnceCell;

use crate::collection::SnapshotCollection;
use crate::error::{Result, SnapshotError};
use crate::file_set::PatternSet;
use crate::snapshot::FileMetadata;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Missing,
    Directory,
    File,
}

/// A path observed during a walk, before any content is read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTreeElement {
    /// Absolute path, interned.
    pub path: Arc<str>,
    /// `/`-separated path relative to the root that produced this element.
    pub relative: Box<str>,
    pub kind: ElementKind,
    pub metadata: FileMetadata,
}

impl FileTreeElement {
    /// Stats a single path without descending into it.
    pub fn stat(path: &Path, interner: &PathInterner) -> Result<Self> {
        let key = interner.intern(&path.to_string_lossy());
        let (kind, metadata) = match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => (ElementKind::Directory, FileMetadata::default()),
            Ok(metadata) => (ElementKind::File, FileMetadata::from_fs(&metadata)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                (ElementKind::Missing, FileMetadata::default())
            }
            Err(err) => return Err(SnapshotError::io(path, err)),
        };
        Ok(Self {
            relative: Box::from(&*key),
            path: key,
            kind,
            metadata,
        })
    }
}

/// The result of walking one declared directory root.
///
/// Entries are sorted by path and include the root itself. A missing root is represented by a
/// single [`ElementKind::Missing`] entry.
#[derive(Debug)]
pub struct VisitedTree {
    root: PathBuf,
    entries: Vec<FileTreeElement>,
    shareable: bool,
    hashed: OnceCell<SnapshotCollection>,
}

impl VisitedTree {
    pub fn new(root: PathBuf, mut entries: Vec<FileTreeElement>, shareable: bool) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|later, earlier| later.path == earlier.path);
        Self {
            root,
            entries,
            shareable,
            hashed: OnceCell::new(),
        }
    }

    pub(crate) fn scan(root: &Path, patterns: &PatternSet, shareable: bool, interner: &PathInterner) -> Result<Self> {
        let root_element = FileTreeElement::stat(root, interner)?;
        let root_element = FileTreeElement {
            relative: Box::from(""),
            ..root_element
        };
        if root_element.kind != ElementKind::Directory {
            return Ok(Self::new(root.to_path_buf(), vec![root_element], shareable));
        }

        let mut entries = vec![root_element];
        for entry in walkdir::WalkDir::new(root).follow_links(true).min_depth(1) {
            let entry = entry.map_err(|source| SnapshotError::Walk {
                root: root.to_path_buf(),
                source,
            })?;
            let relative = relative_key(entry.path().strip_prefix(root).unwrap_or(entry.path()));
            if !patterns.matches(&relative) {
                continue;
            }
            let metadata = entry.metadata().map_err(|source| SnapshotError::Walk {
                root: root.to_path_buf(),
                source,
            })?;
            let (kind, metadata) = if metadata.is_dir() {
                (ElementKind::Directory, FileMetadata::default())
            } else {
                (ElementKind::File, FileMetadata::from_fs(&metadata))
            };
            entries.push(FileTreeElement {
                path: interner.intern(&entry.path().to_string_lossy()),
                relative: relative.into_boxed_str(),
                kind,
                metadata,
            });
        }

        tracing::trace!(
            target = "keel.snapshot",
            root = %root.display(),
            entries = entries.len(),
            "walked tree"
        );
        Ok(Self::new(root.to_path_buf(), entries, shareable))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[FileTreeElement] {
        &self.entries
    }

    /// Whether this tree came from the shared tree-scan cache and may be hashed once for all
    /// work items that observe it.
    pub fn is_shareable(&self) -> bool {
        self.shareable
    }

    pub(crate) fn hashed_or_try_init(
        &self,
        init: impl FnOnce() -> Result<SnapshotCollection>,
    ) -> Result<&SnapshotCollection> {
        self.hashed.get_or_try_init(init)
    }
}

fn relative_key(relative: &Path) -> String {
    let mut key = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(&part.to_string_lossy());
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_includes_root_and_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let interner = PathInterner::new();
        let tree = VisitedTree::scan(dir.path(), &PatternSet::all(), true, &interner).unwrap();
        let relatives: Vec<_> = tree.entries().iter().map(|e| &*e.relative).collect();
        assert_eq!(relatives, vec!["", "a.txt", "sub", "sub/b.txt"]);

        let b = &tree.entries()[3];
        assert_eq!(b.kind, ElementKind::File);
        assert_eq!(b.metadata.length, 2);
        assert!(tree.is_shareable());
    }

    #[test]
    fn missing_root_is_a_single_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("absent");
        let tree = VisitedTree::scan(&root, &PatternSet::all(), false, &PathInterner::new()).unwrap();
        assert_eq!(tree.entries().len(), 1);
        assert_eq!(tree.entries()[0].kind, ElementKind::Missing);
    }

    #[test]
    fn patterns_filter_descendants() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("skip.log"), b"s").unwrap();

        let patterns = PatternSet::new(["*.txt"], Vec::<String>::new()).unwrap();
        let tree = VisitedTree::scan(dir.path(), &patterns, false, &PathInterner::new()).unwrap();
        let relatives: Vec<_> = tree.entries().iter().map(|e| &*e.relative).collect();
        assert_eq!(relatives, vec!["", "keep.txt"]);
    }
}
