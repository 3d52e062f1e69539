use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;
use std::slice;
use std::sync::Arc;

use crate::collection::SnapshotCollection;
use crate::snapshot::{CompareMode, Snapshot};

/// One step of a [`MergeWalk`].
#[derive(Debug)]
pub enum MergeStep<'a, T, U> {
    /// The key is only present on the current side.
    Current(&'a str, T),
    /// The key is only present on the previous side.
    Previous(&'a str, U),
    Both(&'a str, T, U),
}

/// Walks two key-sorted sequences in lockstep.
///
/// Both inputs must be strictly ascending by key; the walk is linear in the combined length.
pub struct MergeWalk<I: Iterator, J: Iterator> {
    current: Peekable<I>,
    previous: Peekable<J>,
}

impl<I: Iterator, J: Iterator> MergeWalk<I, J> {
    pub fn new(current: I, previous: J) -> Self {
        Self {
            current: current.peekable(),
            previous: previous.peekable(),
        }
    }
}

impl<'a, I, J, T, U> Iterator for MergeWalk<I, J>
where
    I: Iterator<Item = (&'a str, T)>,
    J: Iterator<Item = (&'a str, U)>,
{
    type Item = MergeStep<'a, T, U>;

    fn next(&mut self) -> Option<Self::Item> {
        let ordering = match (self.current.peek(), self.previous.peek()) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((current, _)), Some((previous, _))) => current.cmp(previous),
        };
        match ordering {
            Ordering::Less => {
                let (key, value) = self.current.next()?;
                Some(MergeStep::Current(key, value))
            }
            Ordering::Greater => {
                let (key, value) = self.previous.next()?;
                Some(MergeStep::Previous(key, value))
            }
            Ordering::Equal => {
                let (key, current) = self.current.next()?;
                let (_, previous) = self.previous.next()?;
                Some(MergeStep::Both(key, current, previous))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

impl ChangeKind {
    pub fn describe(self) -> &'static str {
        match self {
            ChangeKind::Added => "has been added",
            ChangeKind::Removed => "has been removed",
            ChangeKind::Changed => "has changed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    pub path: Arc<str>,
    pub kind: ChangeKind,
}

impl FileChange {
    pub fn new(path: Arc<str>, kind: ChangeKind) -> Self {
        Self { path, kind }
    }
}

impl fmt::Display for FileChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.path, self.kind.describe())
    }
}

/// A lazily evaluated difference between a current and a previous collection.
#[derive(Clone, Copy)]
pub struct SnapshotDiff<'a> {
    current: &'a SnapshotCollection,
    previous: &'a SnapshotCollection,
    mode: CompareMode,
}

impl<'a> SnapshotDiff<'a> {
    pub(crate) fn new(current: &'a SnapshotCollection, previous: &'a SnapshotCollection, mode: CompareMode) -> Self {
        Self {
            current,
            previous,
            mode,
        }
    }

    pub fn changes(&self) -> DiffChanges<'a> {
        let inner = if self.previous.is_empty() {
            DiffInner::AllAdded(self.current.entries().iter())
        } else if self.current.is_empty() {
            DiffInner::AllRemoved(self.previous.entries().iter())
        } else {
            DiffInner::Walk(MergeWalk::new(
                self.current.entries().iter().map(keyed as KeyFn<'a>),
                self.previous.entries().iter().map(keyed as KeyFn<'a>),
            ))
        };
        DiffChanges {
            inner,
            mode: self.mode,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes().next().is_none()
    }

    /// Applies this diff to `target`, taking added and changed entries from the current side.
    ///
    /// `current.diff(previous, mode).apply_to(previous) == current`.
    pub fn apply_to(&self, target: &SnapshotCollection) -> SnapshotCollection {
        ChangeSet::from_changes(self.changes()).apply_to(target, self.current)
    }
}

type Entry = (Arc<str>, Snapshot);
type KeyFn<'a> = fn(&'a Entry) -> (&'a str, &'a Entry);
type KeyedEntries<'a> = std::iter::Map<slice::Iter<'a, Entry>, KeyFn<'a>>;

fn keyed(entry: &Entry) -> (&str, &Entry) {
    (&entry.0, entry)
}

enum DiffInner<'a> {
    AllAdded(slice::Iter<'a, Entry>),
    AllRemoved(slice::Iter<'a, Entry>),
    Walk(MergeWalk<KeyedEntries<'a>, KeyedEntries<'a>>),
}

/// Iterator over the [`FileChange`]s of a [`SnapshotDiff`], in path order.
pub struct DiffChanges<'a> {
    inner: DiffInner<'a>,
    mode: CompareMode,
}

impl Iterator for DiffChanges<'_> {
    type Item = FileChange;

    fn next(&mut self) -> Option<FileChange> {
        match &mut self.inner {
            DiffInner::AllAdded(entries) => entries
                .next()
                .map(|(path, _)| FileChange::new(path.clone(), ChangeKind::Added)),
            DiffInner::AllRemoved(entries) => entries
                .next()
                .map(|(path, _)| FileChange::new(path.clone(), ChangeKind::Removed)),
            DiffInner::Walk(walk) => loop {
                match walk.next()? {
                    MergeStep::Current(_, (path, _)) => {
                        return Some(FileChange::new(path.clone(), ChangeKind::Added))
                    }
                    MergeStep::Previous(_, (path, _)) => {
                        return Some(FileChange::new(path.clone(), ChangeKind::Removed))
                    }
                    MergeStep::Both(_, (path, current), (_, previous)) => {
                        if !current.is_up_to_date(previous, self.mode) {
                            return Some(FileChange::new(path.clone(), ChangeKind::Changed));
                        }
                    }
                }
            },
        }
    }
}

/// A materialized, path-sorted list of changes that can be replayed onto another collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<FileChange>,
}

impl ChangeSet {
    pub fn from_changes(changes: impl IntoIterator<Item = FileChange>) -> Self {
        let mut changes: Vec<FileChange> = changes.into_iter().collect();
        if !changes.windows(2).all(|w| w[0].path < w[1].path) {
            changes.sort_by(|a, b| a.path.cmp(&b.path));
            changes.dedup_by(|later, earlier| later.path == earlier.path);
        }
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileChange> + '_ {
        self.changes.iter()
    }

    /// Produces `target` with every change applied: removed paths are dropped and added or
    /// changed paths take their entry from `source`. Untouched entries are shared with `target`.
    pub fn apply_to(&self, target: &SnapshotCollection, source: &SnapshotCollection) -> SnapshotCollection {
        if self.changes.is_empty() {
            return target.clone();
        }

        let targets = target.entries().iter().map(|entry| (&*entry.0, entry));
        let changes = self.changes.iter().map(|change| (&*change.path, change));

        let mut merged = Vec::with_capacity(target.len() + self.changes.len());
        for step in MergeWalk::new(targets, changes) {
            match step {
                MergeStep::Current(_, entry) => merged.push(entry.clone()),
                MergeStep::Previous(path, change) | MergeStep::Both(path, _, change) => {
                    if change.kind == ChangeKind::Removed {
                        continue;
                    }
                    match source.get_entry(path) {
                        Some(entry) => merged.push(entry.clone()),
                        None => debug_assert!(false, "change source is missing {path}"),
                    }
                }
            }
        }
        SnapshotCollection::from_sorted(merged)
    }
}
