use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use keel_snapshot::{Blake3FileHasher, ChangeKind, ContentHash, FileChange, FileHasher, FileMetadata, FileSet};
use keel_uptodate::{BuildSession, ChangeReason, InputChanges, SessionConfig, UpToDateError, WorkItem, WorkOutcome};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

#[derive(Default)]
struct RecordingHasher {
    hashed: Mutex<Vec<PathBuf>>,
}

impl RecordingHasher {
    fn take(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.hashed.lock())
    }
}

impl FileHasher for RecordingHasher {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> std::io::Result<ContentHash> {
        self.hashed.lock().push(path.to_path_buf());
        Blake3FileHasher.hash(path, metadata)
    }
}

struct CopyWork {
    path: String,
    input: PathBuf,
    output: PathBuf,
    level: AtomicU64,
    fail: bool,
    runs: AtomicUsize,
    seen: Mutex<Vec<InputChanges>>,
}

impl CopyWork {
    fn new(path: &str, input: PathBuf, output: PathBuf) -> Self {
        Self {
            path: path.to_string(),
            input,
            output,
            level: AtomicU64::new(1),
            fail: false,
            runs: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl WorkItem for CopyWork {
    fn path(&self) -> &str {
        &self.path
    }

    fn work_type(&self) -> &str {
        "Copy"
    }

    fn declared_inputs(&self) -> FileSet {
        FileSet::new().file(&self.input)
    }

    fn declared_outputs(&self) -> FileSet {
        FileSet::new().file(&self.output)
    }

    fn declared_properties(&self) -> Vec<(String, serde_json::Value)> {
        vec![("level".to_string(), json!(self.level.load(Ordering::SeqCst)))]
    }

    fn execute(&self, changes: &InputChanges) -> anyhow::Result<bool> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(changes.clone());
        if self.fail {
            anyhow::bail!("copy failed");
        }
        std::fs::copy(&self.input, &self.output)?;
        Ok(true)
    }
}

/// Declares a whole directory as input and writes one file.
struct ListWork {
    path: String,
    input: PathBuf,
    output: PathBuf,
}

impl WorkItem for ListWork {
    fn path(&self) -> &str {
        &self.path
    }

    fn work_type(&self) -> &str {
        "List"
    }

    fn declared_inputs(&self) -> FileSet {
        FileSet::new().tree(&self.input)
    }

    fn declared_outputs(&self) -> FileSet {
        FileSet::new().file(&self.output)
    }

    fn execute(&self, _changes: &InputChanges) -> anyhow::Result<bool> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.input)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        std::fs::write(&self.output, names.join("\n"))?;
        Ok(true)
    }
}

fn set_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

fn key(path: &Path) -> Arc<str> {
    Arc::from(path.to_string_lossy().as_ref())
}

struct Fixture {
    _dir: tempfile::TempDir,
    _cache: tempfile::TempDir,
    root: PathBuf,
    cache_dir: PathBuf,
    hasher: Arc<RecordingHasher>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("a.txt"), "x").unwrap();
        set_mtime(&root.join("a.txt"), 1_000_000);
        Self {
            root,
            cache_dir: cache.path().to_path_buf(),
            _dir: dir,
            _cache: cache,
            hasher: Arc::new(RecordingHasher::default()),
        }
    }

    fn session(&self) -> BuildSession {
        BuildSession::open_with_hasher(SessionConfig::new(&self.cache_dir), self.hasher.clone()).unwrap()
    }

    fn copy_work(&self) -> CopyWork {
        CopyWork::new(":copy", self.root.join("a.txt"), self.root.join("out.txt"))
    }
}

#[test]
fn reruns_only_when_inputs_change() {
    let fixture = Fixture::new();
    let session = fixture.session();
    let work = fixture.copy_work();
    let input = fixture.root.join("a.txt");
    let output = fixture.root.join("out.txt");

    let first = session.run(&work).unwrap();
    assert_eq!(
        first,
        WorkOutcome::Executed {
            reasons: vec![ChangeReason::NoHistory],
            incremental: false,
            did_work: true,
        }
    );
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "x");
    let history = session.history_store().load(":copy");
    assert_eq!(history.records().len(), 1);
    assert_eq!(
        history.records()[0].output_signatures,
        BTreeSet::from([keel_history::output_signature(&output)])
    );
    fixture.hasher.take();

    let second = session.run(&work).unwrap();
    assert!(second.is_up_to_date());
    assert_eq!(fixture.hasher.take(), Vec::<PathBuf>::new());

    std::fs::write(&input, "y").unwrap();
    set_mtime(&input, 2_000_000);
    let third = session.run(&work).unwrap();
    let changed = FileChange::new(key(&input), ChangeKind::Changed);
    assert_eq!(
        third,
        WorkOutcome::Executed {
            reasons: vec![ChangeReason::InputFile(changed.clone())],
            incremental: true,
            did_work: true,
        }
    );
    assert_eq!(work.seen.lock().last().unwrap().file_changes(), &[changed]);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "y");
    assert_eq!(work.runs.load(Ordering::SeqCst), 2);
    assert_eq!(session.history_store().load(":copy").records().len(), 2);
}

#[test]
fn touched_inputs_refresh_the_record() {
    let fixture = Fixture::new();
    let session = fixture.session();
    let work = fixture.copy_work();
    let input = fixture.root.join("a.txt");

    session.run(&work).unwrap();
    set_mtime(&input, 3_000_000);
    fixture.hasher.take();

    assert!(session.run(&work).unwrap().is_up_to_date());
    assert_eq!(fixture.hasher.take(), vec![input.clone()]);

    assert!(session.run(&work).unwrap().is_up_to_date());
    assert_eq!(fixture.hasher.take(), Vec::<PathBuf>::new());
    assert_eq!(work.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn property_changes_force_a_full_rebuild() {
    let fixture = Fixture::new();
    let session = fixture.session();
    let work = fixture.copy_work();

    session.run(&work).unwrap();
    work.level.store(2, Ordering::SeqCst);
    let outcome = session.run(&work).unwrap();
    assert_eq!(
        outcome,
        WorkOutcome::Executed {
            reasons: vec![ChangeReason::PropertyChanged {
                name: "level".to_string()
            }],
            incremental: false,
            did_work: true,
        }
    );
    assert!(!work.seen.lock().last().unwrap().is_incremental());
}

#[test]
fn deleted_outputs_are_reported() {
    let fixture = Fixture::new();
    let session = fixture.session();
    let work = fixture.copy_work();
    let output = fixture.root.join("out.txt");

    session.run(&work).unwrap();
    std::fs::remove_file(&output).unwrap();

    let outcome = session.run(&work).unwrap();
    assert_eq!(
        outcome,
        WorkOutcome::Executed {
            reasons: vec![ChangeReason::OutputFile(FileChange::new(key(&output), ChangeKind::Changed))],
            incremental: false,
            did_work: true,
        }
    );
    assert!(output.exists());
}

#[test]
fn failed_executions_are_not_recorded() {
    let fixture = Fixture::new();
    let session = fixture.session();
    let work = fixture.copy_work().failing();

    let err = session.run(&work).unwrap_err();
    assert!(matches!(err, UpToDateError::Execution { ref work, .. } if work == ":copy"));
    assert!(session.history_store().load(":copy").is_empty());

    // Still out of date on the next attempt.
    assert!(session.run(&work).is_err());
    assert_eq!(work.runs.load(Ordering::SeqCst), 2);
}

#[test]
fn histories_survive_a_new_session() {
    let fixture = Fixture::new();
    let work = fixture.copy_work();
    {
        let session = fixture.session();
        session.run(&work).unwrap();
        session.finish().unwrap();
    }

    let session = fixture.session();
    assert!(session.run(&work).unwrap().is_up_to_date());
    assert_eq!(work.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn shared_input_trees_are_walked_once_and_dropped_after_the_last_consumer() {
    let fixture = Fixture::new();
    let src = fixture.root.join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("one.txt"), "1").unwrap();
    std::fs::write(src.join("two.txt"), "2").unwrap();

    let first = ListWork {
        path: ":first".to_string(),
        input: src.clone(),
        output: fixture.root.join("first.txt"),
    };
    let second = ListWork {
        path: ":second".to_string(),
        input: src.clone(),
        output: fixture.root.join("second.txt"),
    };

    let session = fixture.session();
    session.prepare(&[&first as &dyn WorkItem, &second as &dyn WorkItem][..]);

    session.run(&first).unwrap();
    assert_eq!(session.tree_cache().len(), 1);
    session.run(&second).unwrap();
    assert_eq!(session.tree_cache().len(), 0);

    let stats = session.tree_cache().stats();
    assert_eq!(stats.scans, 1);
    assert!(stats.hits >= 2);

    // The shared tree was hashed once for both items.
    let hashed = fixture.hasher.take();
    assert_eq!(hashed.iter().filter(|path| path.ends_with("one.txt")).count(), 1);

    session.finish().unwrap();
    assert!(session.tree_cache().is_empty());
}

#[test]
fn unprepared_sessions_see_new_files_in_input_trees() {
    let fixture = Fixture::new();
    let src = fixture.root.join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("one.txt"), "1").unwrap();
    let list = ListWork {
        path: ":list".to_string(),
        input: src.clone(),
        output: fixture.root.join("list.txt"),
    };

    let session = fixture.session();
    session.run(&list).unwrap();
    std::fs::write(src.join("two.txt"), "2").unwrap();

    let outcome = session.run(&list).unwrap();
    assert_eq!(
        outcome,
        WorkOutcome::Executed {
            reasons: vec![ChangeReason::InputFile(FileChange::new(
                key(&src.join("two.txt")),
                ChangeKind::Added
            ))],
            incremental: true,
            did_work: true,
        }
    );
    assert_eq!(std::fs::read_to_string(fixture.root.join("list.txt")).unwrap(), "one.txt\ntwo.txt");
    assert!(session.tree_cache().is_empty());
}
