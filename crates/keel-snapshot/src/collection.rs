use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::diff::SnapshotDiff;
use crate::snapshot::{CompareMode, Snapshot};
use crate::storage_id::StorageId;

type Entry = (Arc<str>, Snapshot);

/// An immutable, path-sorted map from absolute path to [`Snapshot`].
///
/// Clones share both the entries and the storage id, so a collection stored once while
/// recording one work item is referenced (not rewritten) by every later record holding a clone.
#[derive(Clone)]
pub struct SnapshotCollection {
    entries: Arc<[Entry]>,
    storage_id: Arc<StorageId>,
}

impl SnapshotCollection {
    /// The shared empty collection. It is never written to a store.
    pub fn empty() -> Self {
        static EMPTY: OnceLock<SnapshotCollection> = OnceLock::new();
        EMPTY
            .get_or_init(|| SnapshotCollection {
                entries: Arc::from(Vec::new()),
                storage_id: Arc::new(StorageId::new()),
            })
            .clone()
    }

    /// Builds a collection from unordered entries. On duplicate paths the first entry wins.
    pub fn from_entries(entries: impl IntoIterator<Item = (Arc<str>, Snapshot)>) -> Self {
        let mut entries: Vec<Entry> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|later, earlier| later.0 == earlier.0);
        Self::from_sorted(entries)
    }

    /// Rebuilds a collection previously written under `storage_id`.
    pub fn from_stored(entries: impl IntoIterator<Item = (Arc<str>, Snapshot)>, storage_id: i64) -> Self {
        let collection = Self::from_entries(entries);
        if collection.is_empty() {
            return collection;
        }
        Self {
            entries: collection.entries,
            storage_id: Arc::new(StorageId::assigned(storage_id)),
        }
    }

    pub(crate) fn from_sorted(entries: Vec<Entry>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        if entries.is_empty() {
            return Self::empty();
        }
        Self {
            entries: Arc::from(entries),
            storage_id: Arc::new(StorageId::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Arc<str>, Snapshot)] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &Snapshot)> + '_ {
        self.entries.iter().map(|(path, snapshot)| (path, snapshot))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|(path, _)| &**path)
    }

    pub fn get(&self, path: &str) -> Option<&Snapshot> {
        self.get_entry(path).map(|(_, snapshot)| snapshot)
    }

    pub(crate) fn get_entry(&self, path: &str) -> Option<&(Arc<str>, Snapshot)> {
        self.entries
            .binary_search_by(|(candidate, _)| (**candidate).cmp(path))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    /// Whether both handles point at the same underlying entries.
    pub fn ptr_eq(&self, other: &SnapshotCollection) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    /// Lazily diffs `self` (current) against `previous`.
    pub fn diff<'a>(&'a self, previous: &'a SnapshotCollection, mode: CompareMode) -> SnapshotDiff<'a> {
        SnapshotDiff::new(self, previous, mode)
    }

    /// Merges several collections. On duplicate paths the entry from the earliest part wins.
    pub fn merge(parts: impl IntoIterator<Item = SnapshotCollection>) -> Self {
        let mut parts: Vec<SnapshotCollection> = parts.into_iter().filter(|c| !c.is_empty()).collect();
        match parts.len() {
            0 => Self::empty(),
            1 => parts.remove(0),
            _ => Self::from_entries(
                parts
                    .iter()
                    .flat_map(|part| part.entries.iter().cloned())
                    .collect::<Vec<_>>(),
            ),
        }
    }
}

impl Default for SnapshotCollection {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for SnapshotCollection {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.entries == other.entries
    }
}

impl Eq for SnapshotCollection {}

impl fmt::Debug for SnapshotCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
