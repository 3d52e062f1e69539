use std::sync::Arc;

use keel_cache::{PersistentCaches, PersistentIndexedCache, TASK_HISTORY};
use keel_core::PathInterner;
use keel_snapshot::SnapshotCollection;

use crate::error::Result;
use crate::history::ExecutionHistory;
use crate::persisted::{PersistedHistory, PersistedRecord, HISTORY_SCHEMA_VERSION};
use crate::record::{ExecutionRecord, SnapshotRef};
use crate::repository::SnapshotRepository;

/// Loads, updates and persists execution histories keyed by work-item path.
pub struct ExecutionHistoryStore {
    histories: PersistentIndexedCache<PersistedHistory>,
    repository: SnapshotRepository,
    depth: usize,
}

impl ExecutionHistoryStore {
    pub fn new(caches: &PersistentCaches, interner: Arc<PathInterner>, depth: usize) -> Result<Self> {
        Ok(Self {
            histories: caches.indexed(TASK_HISTORY)?,
            repository: SnapshotRepository::new(caches, interner)?,
            depth: depth.max(1),
        })
    }

    pub fn repository(&self) -> &SnapshotRepository {
        &self.repository
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Loads the history of `key`. Unreadable or incompatible histories load as empty.
    pub fn load(&self, key: &str) -> ExecutionHistory {
        let persisted = match self.histories.get(key) {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return ExecutionHistory::new(key),
            Err(err) => {
                tracing::debug!(target = "keel.history", key, error = %err, "failed to load history");
                return ExecutionHistory::new(key);
            }
        };
        if persisted.schema_version != HISTORY_SCHEMA_VERSION {
            tracing::debug!(
                target = "keel.history",
                key,
                schema_version = persisted.schema_version,
                "ignoring history with incompatible schema"
            );
            return ExecutionHistory::new(key);
        }
        let records = persisted.records.iter().map(restore_record).collect();
        ExecutionHistory::loaded(key, records)
    }

    /// Prepends `record` to `history`, storing its snapshots first, and releases the snapshots of
    /// records that fall off the end.
    pub fn record_current(&self, history: &mut ExecutionHistory, mut record: ExecutionRecord) -> Result<()> {
        self.retain_ref(&mut record.input_snapshot)?;
        self.retain_ref(&mut record.output_snapshot)?;
        let evicted = history.prepend(record, self.depth);
        for record in &evicted {
            self.release_ref(&record.input_snapshot)?;
            self.release_ref(&record.output_snapshot)?;
        }
        tracing::debug!(
            target = "keel.history",
            key = history.key(),
            records = history.records().len(),
            evicted = evicted.len(),
            "recorded execution"
        );
        Ok(())
    }

    /// Writes `history` back if it changed since it was loaded. Returns whether it was written.
    pub fn finish(&self, history: &mut ExecutionHistory) -> Result<bool> {
        if !history.is_modified() {
            return Ok(false);
        }
        for record in history.records_mut() {
            self.persist_unsaved(&mut record.input_snapshot)?;
            self.persist_unsaved(&mut record.output_snapshot)?;
        }
        let persisted = PersistedHistory {
            schema_version: HISTORY_SCHEMA_VERSION,
            records: history.records().iter().map(persisted_record).collect(),
        };
        self.histories.put(history.key(), persisted)?;
        history.clear_modified();
        Ok(true)
    }

    /// Resolves a record's snapshot reference.
    pub fn snapshot(&self, reference: &SnapshotRef) -> Result<SnapshotCollection> {
        match reference {
            SnapshotRef::Stored(id) => self.repository.load(*id),
            SnapshotRef::Unsaved(snapshot) => Ok(snapshot.collection.clone()),
        }
    }

    /// Takes a reference on the snapshot, storing it first if it is unsaved.
    fn retain_ref(&self, reference: &mut SnapshotRef) -> Result<()> {
        match reference {
            SnapshotRef::Stored(id) => self.repository.retain(*id),
            SnapshotRef::Unsaved(_) => self.persist_unsaved(reference),
        }
    }

    fn persist_unsaved(&self, reference: &mut SnapshotRef) -> Result<()> {
        let SnapshotRef::Unsaved(snapshot) = reference else {
            return Ok(());
        };
        let id = self.repository.store(snapshot)?;
        self.repository.retain(id)?;
        *reference = SnapshotRef::Stored(id);
        Ok(())
    }

    fn release_ref(&self, reference: &SnapshotRef) -> Result<()> {
        match reference {
            SnapshotRef::Stored(id) => self.repository.release(*id),
            SnapshotRef::Unsaved(_) => Ok(()),
        }
    }
}

fn persisted_record(record: &ExecutionRecord) -> PersistedRecord {
    PersistedRecord {
        work_type: record.work_type.clone(),
        input_hash: record.input_hash,
        output_hash: record.output_hash,
        output_signatures: record.output_signatures.iter().copied().collect(),
        input_properties: record.input_properties.clone(),
        input_snapshot: record.input_snapshot.stored_id().unwrap_or_default(),
        output_snapshot: record.output_snapshot.stored_id().unwrap_or_default(),
    }
}

fn restore_record(record: &PersistedRecord) -> ExecutionRecord {
    ExecutionRecord {
        work_type: record.work_type.clone(),
        input_hash: record.input_hash,
        output_hash: record.output_hash,
        output_signatures: record.output_signatures.iter().copied().collect(),
        input_properties: record.input_properties.clone(),
        input_snapshot: SnapshotRef::Stored(record.input_snapshot),
        output_snapshot: SnapshotRef::Stored(record.output_snapshot),
    }
}
