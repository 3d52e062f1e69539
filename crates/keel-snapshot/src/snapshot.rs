use std::fmt;
use std::sync::Arc;

/// Content hash of a regular file.
///
/// Cloning is a reference-count bump; hashes are shared between collections that reuse entries.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(Arc<[u8]>);

impl ContentHash {
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self::from_bytes(hash.as_bytes())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Length and modification time (milliseconds since the Unix epoch) of a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileMetadata {
    pub length: u64,
    pub last_modified: i64,
}

impl FileMetadata {
    pub fn new(length: u64, last_modified: i64) -> Self {
        Self {
            length,
            last_modified,
        }
    }

    pub fn from_fs(metadata: &std::fs::Metadata) -> Self {
        Self {
            length: metadata.len(),
            last_modified: keel_core::modified_millis(metadata),
        }
    }
}

/// How two snapshots of the same path are compared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompareMode {
    /// Content hashes decide; timestamps are ignored. Used for up-to-date decisions.
    #[default]
    Content,
    /// Length and modification time decide. Used to pick which files need rehashing.
    Metadata,
}

/// The state of one path at the time it was observed.
#[derive(Clone, Debug)]
pub enum Snapshot {
    Missing,
    Directory,
    File {
        hash: ContentHash,
        metadata: FileMetadata,
    },
}

impl Snapshot {
    pub fn file(hash: ContentHash, metadata: FileMetadata) -> Self {
        Self::File { hash, metadata }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Snapshot::Missing)
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        match self {
            Snapshot::File { hash, .. } => Some(hash),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<FileMetadata> {
        match self {
            Snapshot::File { metadata, .. } => Some(*metadata),
            _ => None,
        }
    }

    /// Whether `self` (current) counts as unchanged relative to `previous`.
    pub fn is_up_to_date(&self, previous: &Snapshot, mode: CompareMode) -> bool {
        match (self, previous) {
            (Snapshot::Missing, Snapshot::Missing) => true,
            (Snapshot::Directory, Snapshot::Directory) => true,
            (
                Snapshot::File { hash, metadata },
                Snapshot::File {
                    hash: previous_hash,
                    metadata: previous_metadata,
                },
            ) => match mode {
                CompareMode::Content => hash == previous_hash,
                CompareMode::Metadata => metadata == previous_metadata,
            },
            _ => false,
        }
    }
}

/// Equality is content equality: a touched file with identical bytes is equal.
impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.is_up_to_date(other, CompareMode::Content)
    }
}

impl Eq for Snapshot {}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(bytes: &[u8], length: u64, last_modified: i64) -> Snapshot {
        Snapshot::file(
            ContentHash::from(blake3::hash(bytes)),
            FileMetadata::new(length, last_modified),
        )
    }

    #[test]
    fn content_mode_ignores_timestamps() {
        let before = file(b"hello", 5, 1_000);
        let touched = file(b"hello", 5, 2_000);
        assert!(touched.is_up_to_date(&before, CompareMode::Content));
        assert_eq!(touched, before);
        assert!(!touched.is_up_to_date(&before, CompareMode::Metadata));
    }

    #[test]
    fn metadata_mode_compares_length_and_timestamp() {
        let before = file(b"hello", 5, 1_000);
        let resized = file(b"hello", 6, 1_000);
        assert!(!resized.is_up_to_date(&before, CompareMode::Metadata));
        assert!(before.is_up_to_date(&before.clone(), CompareMode::Metadata));
    }

    #[test]
    fn kind_changes_are_never_up_to_date() {
        let regular = file(b"", 0, 0);
        for mode in [CompareMode::Content, CompareMode::Metadata] {
            assert!(!Snapshot::Directory.is_up_to_date(&regular, mode));
            assert!(!Snapshot::Missing.is_up_to_date(&Snapshot::Directory, mode));
            assert!(Snapshot::Missing.is_up_to_date(&Snapshot::Missing, mode));
        }
    }
}
