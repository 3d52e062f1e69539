use std::ops::Range;
use std::sync::Arc;

use keel_cache::{
    CacheAccessWorker, OverlayCache, PersistentCaches, PersistentIndexedCache, StoreSession, FILE_SNAPSHOTS,
};
use keel_core::PathInterner;
use keel_snapshot::{FileCollectionSnapshot, SnapshotCollection};
use parking_lot::Mutex;

use crate::error::{HistoryError, Result};
use crate::persisted::{restored_entries, stored_entries, StoredCollection};

/// Id of the empty collection. It is never written.
pub const EMPTY_SNAPSHOT_ID: i64 = 0;

const SNAPSHOT_IDS: &str = "snapshotIds";
const SNAPSHOT_REFS: &str = "snapshotRefs";
const NEXT_ID_KEY: &str = "next";
const ID_BLOCK_SIZE: i64 = 64;

fn blob_key(id: i64) -> String {
    id.to_string()
}

/// Content-addressed storage for file-collection snapshots.
///
/// Each collection is written once under an id assigned through its [`StorageId`]. Shareable trees
/// are written as their own blobs and referenced by id from every collection containing them.
/// Every blob carries a reference count; releasing the last reference deletes the blob and
/// releases the trees it references.
///
/// [`StorageId`]: keel_snapshot::StorageId
pub struct SnapshotRepository {
    blobs: PersistentIndexedCache<StoredCollection>,
    worker: Arc<CacheAccessWorker>,
    interner: Arc<PathInterner>,
    ids: Mutex<Range<i64>>,
}

impl SnapshotRepository {
    pub fn new(caches: &PersistentCaches, interner: Arc<PathInterner>) -> Result<Self> {
        Ok(Self {
            blobs: caches.indexed(FILE_SNAPSHOTS)?,
            worker: caches.worker().clone(),
            interner,
            ids: Mutex::new(0..0),
        })
    }

    pub fn interner(&self) -> &Arc<PathInterner> {
        &self.interner
    }

    /// Writes `snapshot` unless it already has an id, returning the id.
    ///
    /// The returned id is not retained; callers that keep it must call [`retain`](Self::retain).
    pub fn store(&self, snapshot: &FileCollectionSnapshot) -> Result<i64> {
        let collection = &snapshot.collection;
        if collection.is_empty() {
            return Ok(EMPTY_SNAPSHOT_ID);
        }
        // A collection assembled from one shared tree is that tree.
        if let Some(tree) = snapshot
            .shared_trees
            .iter()
            .find(|tree| std::ptr::eq(tree.storage_id(), collection.storage_id()))
        {
            return self.store_tree(tree);
        }

        collection.storage_id().get_or_try_assign(|| -> Result<i64> {
            let mut trees = Vec::with_capacity(snapshot.shared_trees.len());
            for tree in snapshot.shared_trees.iter().filter(|tree| !tree.is_empty()) {
                let tree_id = self.store_tree(tree)?;
                if !trees.contains(&tree_id) {
                    trees.push(tree_id);
                }
            }
            let loose = collection.iter().filter(|(path, _)| {
                !snapshot
                    .shared_trees
                    .iter()
                    .any(|tree| tree.get(path).is_some())
            });
            let stored = StoredCollection {
                entries: stored_entries(loose),
                trees,
            };

            let id = self.allocate_id()?;
            for tree_id in &stored.trees {
                self.retain(*tree_id)?;
            }
            self.blobs.put(blob_key(id), stored)?;
            tracing::trace!(
                target = "keel.history",
                id,
                entries = collection.len(),
                trees = snapshot.shared_trees.len(),
                "stored file collection"
            );
            Ok(id)
        })
    }

    fn store_tree(&self, tree: &SnapshotCollection) -> Result<i64> {
        tree.storage_id().get_or_try_assign(|| -> Result<i64> {
            let id = self.allocate_id()?;
            self.blobs.put(
                blob_key(id),
                StoredCollection {
                    trees: Vec::new(),
                    entries: stored_entries(tree.iter()),
                },
            )?;
            tracing::trace!(target = "keel.history", id, entries = tree.len(), "stored shared tree");
            Ok(id)
        })
    }

    /// Loads the collection stored under `id`.
    pub fn load(&self, id: i64) -> Result<SnapshotCollection> {
        if id == EMPTY_SNAPSHOT_ID {
            return Ok(SnapshotCollection::empty());
        }
        let stored = self.load_blob(id)?;
        let mut entries = Vec::new();
        for tree_id in &stored.trees {
            let tree = self.load_blob(*tree_id)?;
            entries.extend(restored_entries(&tree.entries, &self.interner));
        }
        entries.extend(restored_entries(&stored.entries, &self.interner));
        Ok(SnapshotCollection::from_stored(entries, id))
    }

    fn load_blob(&self, id: i64) -> Result<Arc<StoredCollection>> {
        self.blobs
            .get(&blob_key(id))?
            .ok_or(HistoryError::MissingSnapshot { id })
    }

    /// Adds a reference to `id`. The update runs on the cache worker, ordered after the write.
    pub fn retain(&self, id: i64) -> Result<()> {
        if id == EMPTY_SNAPSHOT_ID {
            return Ok(());
        }
        self.worker.enqueue(move |session| {
            let key = blob_key(id);
            let count = session.get::<u64>(SNAPSHOT_REFS, &key).unwrap_or(0);
            session.put(SNAPSHOT_REFS, &key, &(count + 1))
        })?;
        Ok(())
    }

    /// Drops a reference to `id`, deleting the blob (and releasing its trees) when none remain.
    pub fn release(&self, id: i64) -> Result<()> {
        if id == EMPTY_SNAPSHOT_ID {
            return Ok(());
        }
        let overlay = self.blobs.overlay().clone();
        self.worker
            .enqueue(move |session| release_in_session(session, &overlay, id))?;
        Ok(())
    }

    fn allocate_id(&self) -> Result<i64> {
        let mut ids = self.ids.lock();
        if ids.is_empty() {
            *ids = self.worker.read(|session| {
                let next = session
                    .get::<i64>(SNAPSHOT_IDS, NEXT_ID_KEY)
                    .unwrap_or(EMPTY_SNAPSHOT_ID + 1);
                session.put(SNAPSHOT_IDS, NEXT_ID_KEY, &(next + ID_BLOCK_SIZE))?;
                Ok(next..next + ID_BLOCK_SIZE)
            })?;
        }
        let id = ids.start;
        ids.start += 1;
        Ok(id)
    }
}

fn release_in_session(
    session: &mut StoreSession<'_>,
    overlay: &OverlayCache<StoredCollection>,
    id: i64,
) -> keel_cache::Result<()> {
    let mut pending = vec![id];
    while let Some(id) = pending.pop() {
        let key = blob_key(id);
        let count = session.get::<u64>(SNAPSHOT_REFS, &key).unwrap_or(0);
        if count > 1 {
            session.put(SNAPSHOT_REFS, &key, &(count - 1))?;
            continue;
        }
        if let Some(stored) = session.get::<StoredCollection>(FILE_SNAPSHOTS, &key) {
            pending.extend(stored.trees);
        }
        session.remove(SNAPSHOT_REFS, &key)?;
        session.remove(FILE_SNAPSHOTS, &key)?;
        overlay.insert_absent(key);
        tracing::trace!(target = "keel.history", id, "released snapshot");
    }
    Ok(())
}
