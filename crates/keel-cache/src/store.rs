use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::lock::{CacheLock, LockStateToken};
use crate::util::{atomic_write, bincode_deserialize, bincode_serialize, read_file_limited, remove_file_best_effort};

pub const STORE_SCHEMA_VERSION: u32 = 1;

const LOCK_FILE_NAME: &str = "cache.lock";

/// On-disk keyed blob store, one directory per logical cache name.
///
/// Entries live at `<root>/<cache>/<sha256(key)>.bin` inside a versioned envelope that also
/// records the full key, so a fingerprint collision reads as a miss rather than a wrong value.
/// All access goes through a [`StoreSession`], which holds the cross-process lock.
#[derive(Debug)]
pub struct PersistentStore {
    root: PathBuf,
    lock_path: PathBuf,
    lock_acquisitions: AtomicU64,
}

impl PersistentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            lock_path: root.join(LOCK_FILE_NAME),
            root,
            lock_acquisitions: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// How many times the cross-process lock has been acquired through this handle.
    pub fn lock_acquisitions(&self) -> u64 {
        self.lock_acquisitions.load(Ordering::Relaxed)
    }

    /// Blocks until the store lock is held.
    pub fn lock(&self) -> Result<StoreSession<'_>> {
        let mut lock = CacheLock::lock_exclusive(&self.lock_path)?;
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        let token = match lock.state_token() {
            Ok(token) => Some(token),
            Err(err) => {
                tracing::debug!(
                    target = "keel.cache",
                    path = %self.lock_path.display(),
                    error = %err,
                    "failed to read cache lock state"
                );
                None
            }
        };
        Ok(StoreSession {
            store: self,
            lock,
            token,
            dirty: false,
        })
    }

    fn entry_path(&self, cache: &str, key: &str) -> PathBuf {
        let fingerprint = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(cache).join(format!("{fingerprint}.bin"))
    }
}

/// Exclusive access to a [`PersistentStore`] for the lifetime of the value.
///
/// The lock's state token is advanced on [`StoreSession::close`] (or drop) if anything was
/// written or removed.
pub struct StoreSession<'a> {
    store: &'a PersistentStore,
    lock: CacheLock,
    token: Option<LockStateToken>,
    dirty: bool,
}

impl StoreSession<'_> {
    /// The lock state observed when the lock was acquired; `None` if it could not be read.
    pub fn state_token(&self) -> Option<LockStateToken> {
        self.token
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Loads an entry. Corrupt or version-mismatched entries are deleted and read as a miss.
    pub fn get<V: DeserializeOwned>(&self, cache: &str, key: &str) -> Option<V> {
        let path = self.store.entry_path(cache, key);
        let bytes = read_file_limited(&path)?;

        let entry: PersistedEntry<V> = match bincode_deserialize(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(
                    target = "keel.cache",
                    cache,
                    path = %path.display(),
                    error = %err,
                    "discarding undecodable cache entry"
                );
                remove_file_best_effort(&path, "get.corrupt");
                return None;
            }
        };
        if entry.schema_version != STORE_SCHEMA_VERSION || entry.keel_version != keel_core::KEEL_VERSION {
            remove_file_best_effort(&path, "get.incompatible_version");
            return None;
        }
        if entry.key != key {
            return None;
        }
        Some(entry.value)
    }

    pub fn put<V: Serialize + ?Sized>(&mut self, cache: &str, key: &str, value: &V) -> Result<()> {
        let path = self.store.entry_path(cache, key);
        let bytes = bincode_serialize(&PersistedEntryRef {
            schema_version: STORE_SCHEMA_VERSION,
            keel_version: keel_core::KEEL_VERSION,
            key,
            value,
        })?;
        self.dirty = true;
        atomic_write(&path, &bytes)
    }

    pub fn remove(&mut self, cache: &str, key: &str) -> Result<()> {
        let path = self.store.entry_path(cache, key);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.dirty = true;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Publishes pending modifications by advancing the state token, keeping the lock held.
    pub fn commit(&mut self) -> Option<LockStateToken> {
        if !self.dirty {
            return self.token;
        }
        self.dirty = false;
        match self.lock.advance_state() {
            Ok(token) => {
                self.token = Some(token);
                self.token
            }
            Err(err) => {
                tracing::warn!(
                    target = "keel.cache",
                    path = %self.lock.path().display(),
                    error = %err,
                    "failed to advance cache lock state"
                );
                self.token = None;
                None
            }
        }
    }
}

impl Drop for StoreSession<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

#[derive(Serialize)]
struct PersistedEntryRef<'a, V: ?Sized> {
    schema_version: u32,
    keel_version: &'a str,
    key: &'a str,
    value: &'a V,
}

#[derive(Deserialize)]
struct PersistedEntry<V> {
    schema_version: u32,
    keel_version: String,
    key: String,
    value: V,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_round_trip_per_cache_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();

        let mut session = store.lock().unwrap();
        session.put("taskHistory", ":compile", &vec![1u32, 2, 3]).unwrap();
        assert_eq!(session.get::<Vec<u32>>("taskHistory", ":compile"), Some(vec![1, 2, 3]));
        assert_eq!(session.get::<Vec<u32>>("fileSnapshots", ":compile"), None);

        session.remove("taskHistory", ":compile").unwrap();
        assert_eq!(session.get::<Vec<u32>>("taskHistory", ":compile"), None);
    }

    #[test]
    fn writes_advance_the_state_token_reads_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();

        let mut session = store.lock().unwrap();
        let initial = session.state_token().unwrap();
        assert_eq!(session.commit(), Some(initial));
        drop(session);

        let mut session = store.lock().unwrap();
        session.put("c", "k", "v").unwrap();
        let after_write = session.commit().unwrap();
        drop(session);
        assert!(after_write > initial);

        assert_eq!(store.lock().unwrap().state_token(), Some(after_write));
        assert_eq!(store.lock_acquisitions(), 3);
    }

    #[test]
    fn corrupt_entries_are_deleted_and_missed() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        let path = store.entry_path("c", "k");
        atomic_write(&path, b"not bincode").unwrap();

        let session = store.lock().unwrap();
        assert_eq!(session.get::<String>("c", "k"), None);
        assert!(!path.exists());
    }

    #[test]
    fn colliding_keys_miss_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        let mut session = store.lock().unwrap();
        session.put("c", "real", "value").unwrap();

        // Pretend "other" hashed to the same file name as "real".
        let real = store.entry_path("c", "real");
        let other = store.entry_path("c", "other");
        fs::copy(&real, &other).unwrap();

        assert_eq!(session.get::<String>("c", "other"), None);
        assert!(other.exists());
    }
}
