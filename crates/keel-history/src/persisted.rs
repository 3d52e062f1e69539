//! On-disk shapes of histories and snapshots. In-memory types never hit the store directly.

use std::sync::Arc;

use keel_core::PathInterner;
use keel_snapshot::{ContentHash, FileMetadata, Snapshot};
use serde::{Deserialize, Serialize};

pub const HISTORY_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedHistory {
    pub schema_version: u32,
    pub records: Vec<PersistedRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub work_type: String,
    pub input_hash: i32,
    pub output_hash: i32,
    pub output_signatures: Vec<i32>,
    pub input_properties: Vec<(String, String)>,
    pub input_snapshot: i64,
    pub output_snapshot: i64,
}

/// A stored file collection: references to shared tree blobs plus the remaining entries.
///
/// Trees are stored with the same shape and an empty `trees` list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCollection {
    pub trees: Vec<i64>,
    pub entries: Vec<(String, StoredSnapshot)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredSnapshot {
    Missing,
    Directory,
    File {
        hash: Vec<u8>,
        length: u64,
        last_modified: i64,
    },
}

impl From<&Snapshot> for StoredSnapshot {
    fn from(snapshot: &Snapshot) -> Self {
        match snapshot {
            Snapshot::Missing => StoredSnapshot::Missing,
            Snapshot::Directory => StoredSnapshot::Directory,
            Snapshot::File { hash, metadata } => StoredSnapshot::File {
                hash: hash.as_bytes().to_vec(),
                length: metadata.length,
                last_modified: metadata.last_modified,
            },
        }
    }
}

impl StoredSnapshot {
    pub fn to_snapshot(&self) -> Snapshot {
        match self {
            StoredSnapshot::Missing => Snapshot::Missing,
            StoredSnapshot::Directory => Snapshot::Directory,
            StoredSnapshot::File {
                hash,
                length,
                last_modified,
            } => Snapshot::file(ContentHash::from_bytes(hash), FileMetadata::new(*length, *last_modified)),
        }
    }
}

pub(crate) fn stored_entries<'a>(
    entries: impl Iterator<Item = (&'a Arc<str>, &'a Snapshot)>,
) -> Vec<(String, StoredSnapshot)> {
    entries
        .map(|(path, snapshot)| (path.to_string(), StoredSnapshot::from(snapshot)))
        .collect()
}

pub(crate) fn restored_entries<'a>(
    entries: &'a [(String, StoredSnapshot)],
    interner: &'a PathInterner,
) -> impl Iterator<Item = (Arc<str>, Snapshot)> + 'a {
    entries
        .iter()
        .map(|(path, snapshot)| (interner.intern(path), snapshot.to_snapshot()))
}
