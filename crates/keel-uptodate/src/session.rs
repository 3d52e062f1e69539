use std::path::PathBuf;
use std::sync::Arc;

use keel_cache::{CacheCapacityConfig, CachingFileHasher, PersistentCaches, WorkerConfig, FILE_HASHES};
use keel_core::PathInterner;
use keel_history::{ExecutionHistoryStore, DEFAULT_HISTORY_DEPTH};
use keel_snapshot::{Blake3FileHasher, FileHasher, Snapshotter, TreeCachePlan, TreeScanCache};

use crate::change::ChangeReason;
use crate::error::{Result, UpToDateError};
use crate::evaluation::Evaluation;
use crate::summary::DEFAULT_MAX_REASONS;
use crate::work::{WorkGraph, WorkItem};

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub cache_dir: PathBuf,
    pub capacities: CacheCapacityConfig,
    pub worker: WorkerConfig,
    pub history_depth: usize,
    /// How many out-of-date reasons are reported per work item.
    pub max_reasons: usize,
}

impl SessionConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            capacities: CacheCapacityConfig::default(),
            worker: WorkerConfig::default(),
            history_depth: DEFAULT_HISTORY_DEPTH,
            max_reasons: DEFAULT_MAX_REASONS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Outputs were reused; the work item did not run.
    UpToDate,
    Executed {
        reasons: Vec<ChangeReason>,
        incremental: bool,
        did_work: bool,
    },
}

impl WorkOutcome {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, WorkOutcome::UpToDate)
    }
}

/// Everything one build needs to decide which work items to run: the tree-scan cache, the
/// persistent caches and the execution history store.
pub struct BuildSession {
    max_reasons: usize,
    caches: PersistentCaches,
    snapshotter: Snapshotter,
    store: ExecutionHistoryStore,
}

impl BuildSession {
    /// Opens a session hashing files with BLAKE3, memoized in the persistent file-hash cache.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let caches = PersistentCaches::open(&config.cache_dir, config.capacities.clone(), config.worker)?;
        let hasher = CachingFileHasher::new(Blake3FileHasher, caches.indexed(FILE_HASHES)?);
        Self::with_caches(config, caches, Arc::new(hasher))
    }

    pub fn open_with_hasher(config: SessionConfig, hasher: Arc<dyn FileHasher>) -> Result<Self> {
        let caches = PersistentCaches::open(&config.cache_dir, config.capacities.clone(), config.worker)?;
        Self::with_caches(config, caches, hasher)
    }

    fn with_caches(config: SessionConfig, caches: PersistentCaches, hasher: Arc<dyn FileHasher>) -> Result<Self> {
        let interner = Arc::new(PathInterner::new());
        let snapshotter = Snapshotter::with_interner(hasher, Arc::new(TreeScanCache::new()), interner.clone());
        let store = ExecutionHistoryStore::new(&caches, interner, config.history_depth)?;
        tracing::debug!(
            target = "keel.uptodate",
            cache_dir = %config.cache_dir.display(),
            history_depth = store.depth(),
            "opened build session"
        );
        Ok(Self {
            max_reasons: config.max_reasons,
            caches,
            snapshotter,
            store,
        })
    }

    pub fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    pub fn tree_cache(&self) -> &Arc<TreeScanCache> {
        self.snapshotter.tree_cache()
    }

    pub fn history_store(&self) -> &ExecutionHistoryStore {
        &self.store
    }

    pub fn caches(&self) -> &PersistentCaches {
        &self.caches
    }

    /// Analyzes the finalized work graph and installs the resulting tree-cache plan.
    ///
    /// Until a plan is installed, every tree walk is fresh.
    pub fn prepare<G: WorkGraph + ?Sized>(&self, graph: &G) {
        let plan = TreeCachePlan::analyze(&graph.nodes());
        tracing::debug!(
            target = "keel.uptodate",
            cacheable_roots = plan.cacheable_roots().count(),
            "prepared tree cache"
        );
        self.tree_cache().install_plan(Some(plan));
    }

    /// Checks `work` against its history without running it.
    pub fn evaluate(&self, work: &dyn WorkItem) -> Result<Evaluation<'_>> {
        Evaluation::new(&self.snapshotter, &self.store, work)
    }

    /// Runs `work` unless it is up to date, then records the execution.
    pub fn run(&self, work: &dyn WorkItem) -> Result<WorkOutcome> {
        let tree_cache = self.tree_cache();
        tree_cache.before_work(work.path());
        let outcome = self.run_checked(work);
        tree_cache.after_work(work.path());
        outcome
    }

    fn run_checked(&self, work: &dyn WorkItem) -> Result<WorkOutcome> {
        let path = work.path();
        let evaluation = self.evaluate(work)?;
        let summary = evaluation.summary(self.max_reasons)?;
        if summary.is_up_to_date() {
            let mut history = evaluation.into_up_to_date_history();
            self.store.finish(&mut history)?;
            tracing::debug!(target = "keel.uptodate", work = path, "work is up to date");
            return Ok(WorkOutcome::UpToDate);
        }
        for reason in summary.reasons() {
            tracing::info!(target = "keel.uptodate", work = path, reason = %reason, "work is out of date");
        }

        let changes = evaluation.input_changes()?;
        let did_work = match work.execute(&changes) {
            Ok(did_work) => did_work,
            Err(source) => {
                // Whatever the item managed to write is unknown.
                for root in work.declared_outputs().root_paths() {
                    let root = keel_core::absolute_path(root).unwrap_or_else(|_| root.to_path_buf());
                    self.tree_cache().invalidate(&root);
                }
                return Err(UpToDateError::Execution {
                    work: path.to_string(),
                    source,
                });
            }
        };

        let (mut history, record) = evaluation.record_execution(work)?;
        self.store.record_current(&mut history, record)?;
        self.store.finish(&mut history)?;
        Ok(WorkOutcome::Executed {
            reasons: summary.into_reasons(),
            incremental: changes.is_incremental(),
            did_work,
        })
    }

    /// Ends the build: drops every cached tree walk and waits for queued cache writes.
    pub fn finish(&self) -> Result<()> {
        let stats = self.tree_cache().stats();
        self.tree_cache().install_plan(None);
        self.caches.flush()?;
        tracing::debug!(
            target = "keel.uptodate",
            tree_hits = stats.hits,
            tree_scans = stats.scans,
            lock_acquisitions = self.caches.store().lock_acquisitions(),
            "finished build session"
        );
        Ok(())
    }
}

impl Drop for BuildSession {
    fn drop(&mut self) {
        if let Err(err) = self.caches.stop() {
            tracing::warn!(target = "keel.uptodate", error = %err, "failed to stop cache worker");
        }
    }
}
