use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_core::PathInterner;
use parking_lot::{Mutex, RwLock};

use crate::eligibility::TreeCachePlan;
use crate::error::Result;
use crate::file_set::PatternSet;
use crate::tree::VisitedTree;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeCacheStats {
    pub hits: u64,
    pub scans: u64,
    pub cached: usize,
}

/// Build-scoped cache of unfiltered directory walks, keyed by absolute root.
///
/// Only roots the installed [`TreeCachePlan`] marks as eligible are stored, and each entry is
/// dropped once the last item touching its root ran. Without a plan nothing is cached.
#[derive(Debug, Default)]
pub struct TreeScanCache {
    trees: Mutex<HashMap<PathBuf, Arc<VisitedTree>>>,
    plan: RwLock<Option<Arc<TreeCachePlan>>>,
    hits: AtomicU64,
    scans: AtomicU64,
}

impl TreeScanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the walk of `root`, reusing a cached one when `allow_reuse` is set.
    ///
    /// Filtered walks are never read from nor written to the cache.
    pub fn visit(
        &self,
        root: &Path,
        patterns: &PatternSet,
        allow_reuse: bool,
        interner: &PathInterner,
    ) -> Result<Arc<VisitedTree>> {
        if !patterns.is_unfiltered() {
            self.scans.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::new(VisitedTree::scan(root, patterns, false, interner)?));
        }

        if allow_reuse {
            if let Some(tree) = self.trees.lock().get(root).cloned() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target = "keel.snapshot", root = %root.display(), "tree cache hit");
                return Ok(tree);
            }
        }

        self.scans.fetch_add(1, Ordering::Relaxed);
        let cacheable = self.is_cacheable(root);
        let tree = Arc::new(VisitedTree::scan(root, patterns, cacheable, interner)?);
        if cacheable {
            self.trees.lock().insert(root.to_path_buf(), tree.clone());
        }
        Ok(tree)
    }

    pub fn is_cacheable(&self, root: &Path) -> bool {
        match &*self.plan.read() {
            Some(plan) => plan.is_cacheable(root),
            None => false,
        }
    }

    /// Installs (or removes) the eligibility plan for the current build and clears all entries.
    pub fn install_plan(&self, plan: Option<TreeCachePlan>) {
        *self.plan.write() = plan.map(Arc::new);
        self.clear();
    }

    pub fn before_work(&self, work_id: &str) {
        let plan = self.plan.read().clone();
        if plan.is_some_and(|plan| plan.flushes_before(work_id)) {
            tracing::debug!(target = "keel.snapshot", work = work_id, "flushing tree cache before work with unknown inputs");
            self.clear();
        }
    }

    pub fn after_work(&self, work_id: &str) {
        let Some(plan) = self.plan.read().clone() else {
            return;
        };
        if plan.flushes_after(work_id) {
            tracing::debug!(target = "keel.snapshot", work = work_id, "flushing tree cache after work with unknown outputs");
            self.clear();
            return;
        }
        let expired = plan.invalidations_after(work_id);
        if !expired.is_empty() {
            let mut trees = self.trees.lock();
            for root in expired {
                trees.remove(root);
            }
        }
    }

    pub fn invalidate(&self, root: &Path) {
        self.trees.lock().remove(root);
    }

    pub fn clear(&self) {
        self.trees.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.trees.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TreeCacheStats {
        TreeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            cached: self.len(),
        }
    }
}
