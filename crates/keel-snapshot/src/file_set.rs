use std::fmt;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Result, SnapshotError};

/// Include/exclude globs matched against paths relative to a tree root (always `/`-separated).
///
/// An empty pattern set matches everything. Only unfiltered trees are eligible for the
/// tree-scan cache.
#[derive(Clone, Default)]
pub struct PatternSet {
    includes: Vec<String>,
    excludes: Vec<String>,
    include_set: Option<GlobSet>,
    exclude_set: Option<GlobSet>,
}

impl PatternSet {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, E>(includes: I, excludes: E) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let includes: Vec<String> = includes.into_iter().map(Into::into).collect();
        let excludes: Vec<String> = excludes.into_iter().map(Into::into).collect();
        Ok(Self {
            include_set: build_glob_set(&includes)?,
            exclude_set: build_glob_set(&excludes)?,
            includes,
            excludes,
        })
    }

    pub fn is_unfiltered(&self) -> bool {
        self.include_set.is_none() && self.exclude_set.is_none()
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    pub fn matches(&self, relative: &str) -> bool {
        let included = self
            .include_set
            .as_ref()
            .map_or(true, |set| set.is_match(relative));
        included
            && !self
                .exclude_set
                .as_ref()
                .is_some_and(|set| set.is_match(relative))
    }
}

fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| SnapshotError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|source| SnapshotError::InvalidPattern {
        pattern: patterns.join(", "),
        source,
    })?;
    Ok(Some(set))
}

impl fmt::Debug for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternSet")
            .field("includes", &self.includes)
            .field("excludes", &self.excludes)
            .finish()
    }
}

impl PartialEq for PatternSet {
    fn eq(&self, other: &Self) -> bool {
        self.includes == other.includes && self.excludes == other.excludes
    }
}

impl Eq for PatternSet {}

/// One declared location of a work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileRoot {
    /// A single path that is expected to be a regular file (or missing).
    File(PathBuf),
    /// A directory tree, optionally filtered.
    Tree { root: PathBuf, patterns: PatternSet },
}

impl FileRoot {
    pub fn path(&self) -> &Path {
        match self {
            FileRoot::File(path) => path,
            FileRoot::Tree { root, .. } => root,
        }
    }
}

/// The declared inputs or outputs of a work item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSet {
    roots: Vec<FileRoot>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.roots.push(FileRoot::File(path.into()));
        self
    }

    pub fn tree(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(FileRoot::Tree {
            root: root.into(),
            patterns: PatternSet::all(),
        });
        self
    }

    pub fn filtered_tree(mut self, root: impl Into<PathBuf>, patterns: PatternSet) -> Self {
        self.roots.push(FileRoot::Tree {
            root: root.into(),
            patterns,
        });
        self
    }

    pub fn push(&mut self, root: FileRoot) {
        self.roots.push(root);
    }

    pub fn roots(&self) -> &[FileRoot] {
        &self.roots
    }

    pub fn root_paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.roots.iter().map(FileRoot::path)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl FromIterator<FileRoot> for FileSet {
    fn from_iter<T: IntoIterator<Item = FileRoot>>(iter: T) -> Self {
        Self {
            roots: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patterns_match_everything() {
        let patterns = PatternSet::all();
        assert!(patterns.is_unfiltered());
        assert!(patterns.matches("any/thing.txt"));
    }

    #[test]
    fn excludes_win_over_includes() {
        let patterns = PatternSet::new(["**/*.java"], ["generated/**"]).unwrap();
        assert!(!patterns.is_unfiltered());
        assert!(patterns.matches("src/Main.java"));
        assert!(!patterns.matches("generated/Main.java"));
        assert!(!patterns.matches("README.md"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let err = PatternSet::new(["src/[unterminated"], Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidPattern { .. }));
    }
}
