use std::io;
use std::path::Path;

use keel_snapshot::{ContentHash, FileHasher, FileMetadata};
use serde::{Deserialize, Serialize};

use crate::indexed::PersistentIndexedCache;

/// A content hash together with the metadata of the file it was computed from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFileHash {
    pub length: u64,
    pub last_modified: i64,
    pub hash: Vec<u8>,
}

/// Memoizes another [`FileHasher`] in the persistent `fileHashes` cache.
///
/// An entry is reused only while the file's length and modification time match what was
/// recorded, so unchanged files are never reread across builds.
pub struct CachingFileHasher<H> {
    inner: H,
    cache: PersistentIndexedCache<StoredFileHash>,
}

impl<H: FileHasher> CachingFileHasher<H> {
    pub fn new(inner: H, cache: PersistentIndexedCache<StoredFileHash>) -> Self {
        Self { inner, cache }
    }
}

impl<H: FileHasher> FileHasher for CachingFileHasher<H> {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> io::Result<ContentHash> {
        let key = path.to_string_lossy();
        match self.cache.get(&key) {
            Ok(Some(stored)) if stored.length == metadata.length && stored.last_modified == metadata.last_modified => {
                return Ok(ContentHash::from_bytes(&stored.hash));
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(
                    target = "keel.cache",
                    path = %path.display(),
                    error = %err,
                    "file hash cache unavailable; hashing directly"
                );
            }
        }

        let hash = self.inner.hash(path, metadata)?;
        let stored = StoredFileHash {
            length: metadata.length,
            last_modified: metadata.last_modified,
            hash: hash.as_bytes().to_vec(),
        };
        if let Err(err) = self.cache.put(key.into_owned(), stored) {
            tracing::debug!(
                target = "keel.cache",
                path = %path.display(),
                error = %err,
                "failed to record file hash"
            );
        }
        Ok(hash)
    }
}
