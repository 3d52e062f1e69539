//! Persistent caching for Keel.
//!
//! Three layers sit between callers and the disk:
//!
//! - [`PersistentStore`]: keyed, versioned blobs under a cross-process file lock whose contents
//!   carry a [`LockStateToken`].
//! - [`CacheAccessWorker`]: the only thread that touches the store. It batches queued work under
//!   one lock acquisition.
//! - [`InMemoryCacheOverlay`]: bounded LRU maps per logical cache, cleared whenever the lock state
//!   shows another process wrote to the store.
//!
//! [`PersistentCaches`] wires the three together and hands out typed
//! [`PersistentIndexedCache`] views.

mod capacity;
mod error;
mod file_hashes;
mod indexed;
mod lock;
mod overlay;
mod store;
mod util;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use capacity::{CacheCapacityConfig, FILE_HASHES, FILE_SNAPSHOTS, TASK_HISTORY};
pub use error::{CacheError, Result};
pub use file_hashes::{CachingFileHasher, StoredFileHash};
pub use indexed::PersistentIndexedCache;
pub use lock::{CacheLock, LockStateToken};
pub use overlay::{InMemoryCacheOverlay, OverlayCache};
pub use store::{PersistentStore, StoreSession, STORE_SCHEMA_VERSION};
pub use util::{atomic_write, BINCODE_PAYLOAD_LIMIT_BYTES};
pub use worker::{CacheAccessWorker, LockListener, NoopLockListener, WorkerConfig};

/// A store, its access worker and the in-memory overlay, opened together.
pub struct PersistentCaches {
    overlay: Arc<InMemoryCacheOverlay>,
    worker: Arc<CacheAccessWorker>,
}

impl PersistentCaches {
    pub fn open(dir: impl Into<PathBuf>, capacities: CacheCapacityConfig, worker_config: WorkerConfig) -> Result<Self> {
        let dir = dir.into();
        let store = Arc::new(PersistentStore::open(&dir)?);
        let overlay = Arc::new(InMemoryCacheOverlay::new(capacities));
        let worker = Arc::new(CacheAccessWorker::spawn(store, overlay.clone(), worker_config)?);
        tracing::debug!(target = "keel.cache", dir = %dir.display(), "opened persistent caches");
        Ok(Self { overlay, worker })
    }

    pub fn indexed<V>(&self, name: &str) -> Result<PersistentIndexedCache<V>>
    where
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Ok(PersistentIndexedCache::new(
            name,
            self.overlay.cache::<V>(name)?,
            self.worker.clone(),
        ))
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        self.worker.store()
    }

    pub fn worker(&self) -> &Arc<CacheAccessWorker> {
        &self.worker
    }

    pub fn overlay(&self) -> &Arc<InMemoryCacheOverlay> {
        &self.overlay
    }

    pub fn flush(&self) -> Result<()> {
        self.worker.flush()
    }

    pub fn stop(&self) -> Result<()> {
        self.worker.stop()
    }
}
