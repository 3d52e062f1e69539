use std::collections::BTreeSet;

use crate::record::ExecutionRecord;

/// Default number of records kept per work item.
pub const DEFAULT_HISTORY_DEPTH: usize = 3;

/// The bounded, most-recent-first execution history of one work item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionHistory {
    key: String,
    records: Vec<ExecutionRecord>,
    modified_since_load: bool,
}

impl ExecutionHistory {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            records: Vec::new(),
            modified_since_load: false,
        }
    }

    pub(crate) fn loaded(key: impl Into<String>, records: Vec<ExecutionRecord>) -> Self {
        Self {
            key: key.into(),
            records,
            modified_since_load: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_modified(&self) -> bool {
        self.modified_since_load
    }

    pub fn mark_modified(&mut self) {
        self.modified_since_load = true;
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified_since_load = false;
    }

    /// Index of the record whose output signatures overlap `current` the most.
    ///
    /// Ties go to the more recent record. A record without signatures matches a work item without
    /// outputs outright, and a record covering every current signature ends the scan.
    pub fn best_match(&self, current: &BTreeSet<i32>) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, record) in self.records.iter().enumerate() {
            if current.is_empty() && record.output_signatures.is_empty() {
                return Some(idx);
            }
            let overlap = current.intersection(&record.output_signatures).count();
            if best.map_or(true, |(_, best_overlap)| overlap > best_overlap) {
                best = Some((idx, overlap));
            }
            if !current.is_empty() && overlap == current.len() {
                break;
            }
        }
        best.map(|(idx, _)| idx)
    }

    pub fn record(&self, idx: usize) -> Option<&ExecutionRecord> {
        self.records.get(idx)
    }

    /// Mutable access to a record; marks the history as modified.
    pub fn record_mut(&mut self, idx: usize) -> Option<&mut ExecutionRecord> {
        let record = self.records.get_mut(idx)?;
        self.modified_since_load = true;
        Some(record)
    }

    pub(crate) fn records_mut(&mut self) -> &mut [ExecutionRecord] {
        &mut self.records
    }

    /// Prepends `record` and truncates to `depth`, returning the evicted records (oldest last).
    pub(crate) fn prepend(&mut self, record: ExecutionRecord, depth: usize) -> Vec<ExecutionRecord> {
        self.records.insert(0, record);
        self.modified_since_load = true;
        let depth = depth.max(1);
        if self.records.len() > depth {
            self.records.split_off(depth)
        } else {
            Vec::new()
        }
    }
}
