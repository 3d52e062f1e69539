use std::sync::Arc;

use crate::tree::{ElementKind, FileTreeElement, VisitedTree};

/// Everything a walk observed for one [`FileSet`](crate::FileSet), without file contents.
///
/// Equal [`PreCheck::hash`] values are a necessary (not sufficient) condition for unchanged
/// files: they let an up-to-date check skip hashing when nothing moved on disk.
#[derive(Clone, Debug)]
pub struct PreCheck {
    hash: i32,
    trees: Vec<Arc<VisitedTree>>,
    loose: Vec<FileTreeElement>,
}

impl PreCheck {
    pub fn new(trees: Vec<Arc<VisitedTree>>, loose: Vec<FileTreeElement>) -> Self {
        let hash = structural_hash(&trees, &loose);
        Self { hash, trees, loose }
    }

    pub fn hash(&self) -> i32 {
        self.hash
    }

    pub fn visited_trees(&self) -> &[Arc<VisitedTree>] {
        &self.trees
    }

    /// Elements of single-file roots.
    pub fn loose(&self) -> &[FileTreeElement] {
        &self.loose
    }

    pub fn elements(&self) -> impl Iterator<Item = &FileTreeElement> + '_ {
        self.trees
            .iter()
            .flat_map(|tree| tree.entries().iter())
            .chain(self.loose.iter())
    }

    pub fn missing_files(&self) -> impl Iterator<Item = &Arc<str>> + '_ {
        self.elements()
            .filter(|element| element.kind == ElementKind::Missing)
            .map(|element| &element.path)
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty() && self.loose.is_empty()
    }
}

/// Order-independent hash of roots, relative paths, kinds, lengths and timestamps.
///
/// Elements are put into a stable order first (directories last, then modification time, size
/// and path) so the walk order of the filesystem does not matter.
fn structural_hash(trees: &[Arc<VisitedTree>], loose: &[FileTreeElement]) -> i32 {
    let mut roots: Vec<String> = trees
        .iter()
        .map(|tree| tree.root().to_string_lossy().into_owned())
        .collect();
    roots.sort();
    roots.dedup();

    let mut elements: Vec<&FileTreeElement> = trees
        .iter()
        .flat_map(|tree| tree.entries().iter())
        .chain(loose.iter())
        .collect();
    elements.sort_by(|a, b| {
        (a.kind == ElementKind::Directory)
            .cmp(&(b.kind == ElementKind::Directory))
            .then(a.metadata.last_modified.cmp(&b.metadata.last_modified))
            .then(a.metadata.length.cmp(&b.metadata.length))
            .then(a.path.cmp(&b.path))
    });

    let mut hasher = blake3::Hasher::new();
    for root in &roots {
        hasher.update(root.as_bytes());
        hasher.update(&[0]);
    }
    for element in elements {
        hasher.update(element.relative.as_bytes());
        hasher.update(&[
            0,
            match element.kind {
                ElementKind::Missing => 0,
                ElementKind::Directory => 1,
                ElementKind::File => 2,
            },
        ]);
        hasher.update(&element.metadata.length.to_le_bytes());
        hasher.update(&element.metadata.last_modified.to_le_bytes());
    }
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
