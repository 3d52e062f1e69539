use std::fs::File;
use std::io;
use std::path::Path;

use crate::snapshot::{ContentHash, FileMetadata};

/// Computes the content hash of a regular file.
///
/// `metadata` is what the walk observed; implementations may use it as a cache key.
pub trait FileHasher: Send + Sync {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> io::Result<ContentHash>;
}

/// Streams the file through BLAKE3.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3FileHasher;

impl FileHasher for Blake3FileHasher {
    fn hash(&self, path: &Path, _metadata: FileMetadata) -> io::Result<ContentHash> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hasher.finalize().into())
    }
}
