use std::collections::HashMap;

/// Logical cache holding file-collection snapshots and trees.
pub const FILE_SNAPSHOTS: &str = "fileSnapshots";
/// Logical cache holding per-work-item execution histories.
pub const TASK_HISTORY: &str = "taskHistory";
/// Logical cache holding content hashes keyed by path and metadata.
pub const FILE_HASHES: &str = "fileHashes";

const GIB: u64 = 1024 * 1024 * 1024;

/// Baseline capacities assume a 1 GiB heap.
const BASELINE_HEAP_BYTES: u64 = GIB;
const MIN_SCALE: f64 = 0.2;
const DEFAULT_CAPACITY: usize = 1_000;

fn baseline_capacity(name: &str) -> usize {
    match name {
        FILE_SNAPSHOTS => 10_000,
        TASK_HISTORY => 2_000,
        FILE_HASHES => 400_000,
        _ => DEFAULT_CAPACITY,
    }
}

/// Entry limits for the in-memory overlay, scaled to the memory the process may use.
///
/// A cache gets `baseline * clamp(max_heap / 1 GiB, 0.2, 1.0)` entries unless it has an explicit
/// override.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheCapacityConfig {
    max_heap_bytes: u64,
    overrides: HashMap<String, usize>,
}

impl CacheCapacityConfig {
    pub fn new(max_heap_bytes: u64) -> Self {
        Self {
            max_heap_bytes,
            overrides: HashMap::new(),
        }
    }

    /// Uses a quarter of the physical memory as the heap budget.
    pub fn detect() -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            static REPORTED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(target = "keel.cache", "total memory unavailable; using baseline cache capacities");
            }
            return Self::new(BASELINE_HEAP_BYTES);
        }
        Self::new(total / 4)
    }

    pub fn with_override(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.overrides.insert(name.into(), capacity);
        self
    }

    pub fn max_heap_bytes(&self) -> u64 {
        self.max_heap_bytes
    }

    pub fn scale_factor(&self) -> f64 {
        (self.max_heap_bytes as f64 / BASELINE_HEAP_BYTES as f64).clamp(MIN_SCALE, 1.0)
    }

    pub fn capacity_for(&self, name: &str) -> usize {
        if let Some(&capacity) = self.overrides.get(name) {
            return capacity.max(1);
        }
        ((baseline_capacity(name) as f64 * self.scale_factor()) as usize).max(1)
    }
}

impl Default for CacheCapacityConfig {
    fn default() -> Self {
        Self::new(BASELINE_HEAP_BYTES)
    }
}
