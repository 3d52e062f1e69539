//! Execution histories for Keel work items.
//!
//! An [`ExecutionHistory`] holds the most recent [`ExecutionRecord`]s of one work item. Records
//! reference their input and output file snapshots by id; the snapshots themselves live in the
//! [`SnapshotRepository`], which writes shared trees once and reclaims blobs when the last record
//! referencing them is evicted.

mod error;
mod history;
mod persisted;
mod record;
mod repository;
mod store;

pub use error::{HistoryError, Result};
pub use history::{ExecutionHistory, DEFAULT_HISTORY_DEPTH};
pub use persisted::{PersistedHistory, PersistedRecord, StoredCollection, StoredSnapshot, HISTORY_SCHEMA_VERSION};
pub use record::{encode_properties, output_signature, output_signatures, ExecutionRecord, SnapshotRef};
pub use repository::{SnapshotRepository, EMPTY_SNAPSHOT_ID};
pub use store::ExecutionHistoryStore;
