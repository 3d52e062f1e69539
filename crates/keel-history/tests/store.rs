use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use keel_cache::{CacheCapacityConfig, PersistentCaches, WorkerConfig, TASK_HISTORY};
use keel_core::PathInterner;
use keel_history::{
    ExecutionHistoryStore, ExecutionRecord, HistoryError, PersistedHistory, PersistedRecord, SnapshotRef,
};
use keel_snapshot::{
    Blake3FileHasher, FileCollectionSnapshot, FileSet, Snapshotter, TreeCachePlan, TreeScanCache, WorkNode,
};
use pretty_assertions::assert_eq;

fn open(dir: &Path) -> PersistentCaches {
    PersistentCaches::open(dir, CacheCapacityConfig::default(), WorkerConfig::default()).unwrap()
}

fn history_store(caches: &PersistentCaches, depth: usize) -> ExecutionHistoryStore {
    ExecutionHistoryStore::new(caches, Arc::new(PathInterner::new()), depth).unwrap()
}

fn record(input_hash: i32, input: FileCollectionSnapshot) -> ExecutionRecord {
    ExecutionRecord {
        work_type: "Copy".to_string(),
        input_hash,
        output_hash: 0,
        output_signatures: BTreeSet::from([7]),
        input_properties: vec![("level".to_string(), "3".to_string())],
        input_snapshot: SnapshotRef::Unsaved(input),
        output_snapshot: SnapshotRef::Unsaved(FileCollectionSnapshot::default()),
    }
}

fn blob_count(dir: &Path, cache: &str) -> usize {
    match std::fs::read_dir(dir.join(cache)) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "bin"))
            .count(),
        Err(_) => 0,
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    snapshotter: Snapshotter,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("src")).unwrap();
        std::fs::write(root.join("src/a.txt"), b"a").unwrap();
        std::fs::write(root.join("src/b.txt"), b"b").unwrap();
        std::fs::write(root.join("one.txt"), b"one").unwrap();
        std::fs::write(root.join("two.txt"), b"two").unwrap();
        let tree_cache = Arc::new(TreeScanCache::new());
        let src = Some(vec![root.join("src")]);
        tree_cache.install_plan(Some(TreeCachePlan::analyze(&[
            WorkNode::new(":a", src.clone(), Some(Vec::new())),
            WorkNode::new(":b", src, Some(Vec::new())),
        ])));
        let snapshotter = Snapshotter::new(Arc::new(Blake3FileHasher), tree_cache);
        Self {
            _dir: dir,
            root,
            snapshotter,
        }
    }

    fn snapshot(&self, files: &FileSet) -> FileCollectionSnapshot {
        let precheck = self.snapshotter.precheck(files).unwrap();
        self.snapshotter.snapshot(&precheck).unwrap()
    }
}

#[test]
fn history_keeps_the_most_recent_records() {
    let dir = tempfile::tempdir().unwrap();
    let caches = open(dir.path());
    let store = history_store(&caches, 3);

    for input_hash in 0..4 {
        let mut history = store.load(":compile");
        store
            .record_current(&mut history, record(input_hash, FileCollectionSnapshot::default()))
            .unwrap();
        assert!(store.finish(&mut history).unwrap());
        assert!(!history.is_modified());
    }
    caches.stop().unwrap();

    let caches = open(dir.path());
    let history = history_store(&caches, 3).load(":compile");
    let hashes: Vec<_> = history.records().iter().map(|r| r.input_hash).collect();
    assert_eq!(hashes, vec![3, 2, 1]);
    assert_eq!(history.records()[0].property("level"), Some("3"));
    assert!(!history.is_modified());
}

#[test]
fn unmodified_histories_are_not_written() {
    let dir = tempfile::tempdir().unwrap();
    let caches = open(dir.path());
    let store = history_store(&caches, 3);

    let mut history = store.load(":idle");
    assert!(history.is_empty());
    assert!(!store.finish(&mut history).unwrap());
    caches.flush().unwrap();
    assert_eq!(blob_count(dir.path(), TASK_HISTORY), 0);
}

#[test]
fn snapshots_survive_reopen_and_share_trees() {
    let fixture = Fixture::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let caches = open(cache_dir.path());
    let store = history_store(&caches, 3);

    let first = fixture.snapshot(&FileSet::new().tree(fixture.root.join("src")).file(fixture.root.join("one.txt")));
    let second = fixture.snapshot(&FileSet::new().tree(fixture.root.join("src")).file(fixture.root.join("two.txt")));
    assert_eq!(first.shared_trees.len(), 1);

    let mut history = store.load(":a");
    store.record_current(&mut history, record(1, first.clone())).unwrap();
    store.finish(&mut history).unwrap();
    let mut history = store.load(":b");
    store.record_current(&mut history, record(2, second.clone())).unwrap();
    store.finish(&mut history).unwrap();
    caches.stop().unwrap();

    // One blob per collection plus the shared tree.
    assert_eq!(blob_count(cache_dir.path(), keel_cache::FILE_SNAPSHOTS), 3);

    let caches = open(cache_dir.path());
    let store = history_store(&caches, 3);
    let history = store.load(":a");
    let restored = store.snapshot(&history.records()[0].input_snapshot).unwrap();
    assert_eq!(restored, first.collection);
    let history = store.load(":b");
    let restored = store.snapshot(&history.records()[0].input_snapshot).unwrap();
    assert_eq!(restored, second.collection);
}

#[test]
fn tree_only_collections_are_stored_once() {
    let fixture = Fixture::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let caches = open(cache_dir.path());
    let store = history_store(&caches, 3);

    let snapshot = fixture.snapshot(&FileSet::new().tree(fixture.root.join("src")));
    let id = store.repository().store(&snapshot).unwrap();
    assert_eq!(store.repository().store(&snapshot).unwrap(), id);
    assert_eq!(snapshot.shared_trees[0].storage_id().get(), Some(id));
    caches.flush().unwrap();
    assert_eq!(blob_count(cache_dir.path(), keel_cache::FILE_SNAPSHOTS), 1);
}

#[test]
fn evicted_snapshots_are_released() {
    let fixture = Fixture::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let caches = open(cache_dir.path());
    let store = history_store(&caches, 1);

    let snapshot = fixture.snapshot(&FileSet::new().tree(fixture.root.join("src")).file(fixture.root.join("one.txt")));
    let mut history = store.load(":w");
    store.record_current(&mut history, record(1, snapshot)).unwrap();
    let SnapshotRef::Stored(id) = history.records()[0].input_snapshot else {
        panic!("recorded snapshots are stored");
    };
    caches.flush().unwrap();
    assert_eq!(blob_count(cache_dir.path(), keel_cache::FILE_SNAPSHOTS), 2);

    store
        .record_current(&mut history, record(2, FileCollectionSnapshot::default()))
        .unwrap();
    store.finish(&mut history).unwrap();
    caches.flush().unwrap();

    assert_eq!(history.records().len(), 1);
    assert_eq!(blob_count(cache_dir.path(), keel_cache::FILE_SNAPSHOTS), 0);
    assert!(matches!(
        store.repository().load(id),
        Err(HistoryError::MissingSnapshot { .. })
    ));
}

#[test]
fn snapshots_shared_by_two_records_outlive_one_eviction() {
    let fixture = Fixture::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let caches = open(cache_dir.path());
    let store = history_store(&caches, 2);

    let snapshot = fixture.snapshot(&FileSet::new().file(fixture.root.join("one.txt")));
    let mut history = store.load(":w");
    store.record_current(&mut history, record(1, snapshot.clone())).unwrap();
    store.record_current(&mut history, record(2, snapshot.clone())).unwrap();
    store
        .record_current(&mut history, record(3, FileCollectionSnapshot::default()))
        .unwrap();
    caches.flush().unwrap();
    assert_eq!(blob_count(cache_dir.path(), keel_cache::FILE_SNAPSHOTS), 1);

    let restored = store.snapshot(&history.records()[1].input_snapshot).unwrap();
    assert_eq!(restored, snapshot.collection);
}

#[test]
fn corrupt_histories_load_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let caches = open(dir.path());
    let store = history_store(&caches, 3);
    let mut history = store.load(":w");
    store
        .record_current(&mut history, record(1, FileCollectionSnapshot::default()))
        .unwrap();
    store.finish(&mut history).unwrap();
    caches.stop().unwrap();

    for entry in std::fs::read_dir(dir.path().join(TASK_HISTORY)).unwrap() {
        std::fs::write(entry.unwrap().path(), b"not a history").unwrap();
    }

    let caches = open(dir.path());
    assert!(history_store(&caches, 3).load(":w").is_empty());
}

#[test]
fn histories_with_another_schema_load_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let caches = open(dir.path());
    caches
        .indexed::<PersistedHistory>(TASK_HISTORY)
        .unwrap()
        .put(
            ":w",
            PersistedHistory {
                schema_version: 99,
                records: vec![PersistedRecord {
                    work_type: "Copy".to_string(),
                    input_hash: 1,
                    output_hash: 2,
                    output_signatures: vec![3],
                    input_properties: Vec::new(),
                    input_snapshot: 0,
                    output_snapshot: 0,
                }],
            },
        )
        .unwrap();
    caches.stop().unwrap();

    let caches = open(dir.path());
    assert!(history_store(&caches, 3).load(":w").is_empty());
}
