use std::collections::BTreeSet;
use std::iter;
use std::path::PathBuf;

use keel_history::{ExecutionHistory, ExecutionHistoryStore, ExecutionRecord, HistoryError, SnapshotRef};
use keel_snapshot::{CompareMode, FileChange, FileCollectionSnapshot, PreCheck, SnapshotCollection, Snapshotter};
use once_cell::unsync::OnceCell;

use crate::change::ChangeReason;
use crate::error::Result;
use crate::summary::{first_change, summarize, ChangeIter, ChangeSummary};
use crate::work::{InputChanges, WorkItem};

/// The up-to-date check of one work item against its best matching execution record.
///
/// Rules share the snapshots they need through lazily initialized cells, so a rule that is never
/// consulted never walks or hashes anything beyond the initial prechecks.
pub struct Evaluation<'s> {
    snapshotter: &'s Snapshotter,
    store: &'s ExecutionHistoryStore,
    work_type: String,
    history: ExecutionHistory,
    matched: Option<usize>,
    output_signatures: BTreeSet<i32>,
    properties: Vec<(String, String)>,
    inputs: PreCheck,
    outputs: PreCheck,
    input_snapshot: OnceCell<FileCollectionSnapshot>,
    outputs_before: OnceCell<SnapshotCollection>,
    previous_inputs: OnceCell<SnapshotCollection>,
    previous_outputs: OnceCell<SnapshotCollection>,
}

impl<'s> Evaluation<'s> {
    pub fn new(snapshotter: &'s Snapshotter, store: &'s ExecutionHistoryStore, work: &dyn WorkItem) -> Result<Self> {
        let history = store.load(work.path());
        let output_roots: Vec<PathBuf> = work
            .declared_outputs()
            .root_paths()
            .map(|path| keel_core::absolute_path(path).unwrap_or_else(|_| path.to_path_buf()))
            .collect();
        let output_signatures = keel_history::output_signatures(output_roots.iter().map(PathBuf::as_path));
        let matched = history.best_match(&output_signatures);
        let properties = keel_history::encode_properties(&work.declared_properties())?;
        let inputs = snapshotter.precheck(&work.declared_inputs())?;
        let outputs = snapshotter.precheck(&work.declared_outputs())?;

        tracing::trace!(
            target = "keel.uptodate",
            work = work.path(),
            records = history.records().len(),
            matched = ?matched,
            "evaluating work item"
        );

        Ok(Self {
            snapshotter,
            store,
            work_type: work.work_type().to_string(),
            history,
            matched,
            output_signatures,
            properties,
            inputs,
            outputs,
            input_snapshot: OnceCell::new(),
            outputs_before: OnceCell::new(),
            previous_inputs: OnceCell::new(),
            previous_outputs: OnceCell::new(),
        })
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    /// The execution record the work item is compared against.
    pub fn matched_record(&self) -> Option<&ExecutionRecord> {
        self.matched.and_then(|idx| self.history.record(idx))
    }

    pub fn output_signatures(&self) -> &BTreeSet<i32> {
        &self.output_signatures
    }

    /// All rules, in evaluation order.
    pub fn rules(&self) -> [ChangeIter<'_>; 5] {
        [
            self.history_changes(),
            self.type_changes(),
            self.property_changes(),
            self.output_changes(),
            self.input_changes_rule(),
        ]
    }

    /// Rules whose changes force a full rebuild rather than an incremental one.
    pub fn rebuild_rules(&self) -> [ChangeIter<'_>; 4] {
        [
            self.history_changes(),
            self.type_changes(),
            self.property_changes(),
            self.output_changes(),
        ]
    }

    pub fn summary(&self, max_reasons: usize) -> Result<ChangeSummary> {
        summarize(self.rules(), max_reasons)
    }

    pub fn rebuild_reason(&self) -> Result<Option<ChangeReason>> {
        first_change(self.rebuild_rules())
    }

    /// What the work item may be told about its inputs when it executes.
    pub fn input_changes(&self) -> Result<InputChanges> {
        if let Some(reason) = self.rebuild_reason()? {
            tracing::debug!(target = "keel.uptodate", reason = %reason, "executing non-incrementally");
            return Ok(InputChanges::full_rebuild());
        }
        let mut changes = Vec::new();
        for change in self.input_changes_rule() {
            if let ChangeReason::InputFile(change) = change? {
                changes.push(change);
            }
        }
        Ok(InputChanges::incremental(changes))
    }

    fn history_changes(&self) -> ChangeIter<'_> {
        match self.matched {
            Some(_) => Box::new(iter::empty()),
            None => Box::new(iter::once(Ok(ChangeReason::NoHistory))),
        }
    }

    fn type_changes(&self) -> ChangeIter<'_> {
        let Some(record) = self.matched_record() else {
            return Box::new(iter::empty());
        };
        if record.work_type == self.work_type {
            return Box::new(iter::empty());
        }
        Box::new(iter::once(Ok(ChangeReason::TypeChanged {
            previous: record.work_type.clone(),
            current: self.work_type.clone(),
        })))
    }

    fn property_changes(&self) -> ChangeIter<'_> {
        let Some(record) = self.matched_record() else {
            return Box::new(iter::empty());
        };
        let current = self.properties.iter().filter_map(move |(name, value)| {
            let reason = match record.property(name) {
                Some(previous) if previous == value => return None,
                Some(_) => ChangeReason::PropertyChanged { name: name.clone() },
                None => ChangeReason::PropertyAdded { name: name.clone() },
            };
            Some(Ok(reason))
        });
        let removed = record
            .input_properties
            .iter()
            .filter(move |(name, _)| !self.properties.iter().any(|(current, _)| current == name))
            .map(|(name, _)| Ok(ChangeReason::PropertyRemoved { name: name.clone() }));
        Box::new(current.chain(removed))
    }

    fn output_changes(&self) -> ChangeIter<'_> {
        let Some(record) = self.matched_record() else {
            return Box::new(iter::empty());
        };
        if record.output_hash == self.outputs.hash() {
            return Box::new(iter::empty());
        }
        lazy_diff(
            move || Ok((self.outputs_before()?, self.previous_outputs()?)),
            ChangeReason::OutputFile,
        )
    }

    fn input_changes_rule(&self) -> ChangeIter<'_> {
        let Some(record) = self.matched_record() else {
            return Box::new(iter::empty());
        };
        if record.input_hash == self.inputs.hash() {
            return Box::new(iter::empty());
        }
        lazy_diff(
            move || Ok((&self.input_snapshot()?.collection, self.previous_inputs()?)),
            ChangeReason::InputFile,
        )
    }

    fn input_snapshot(&self) -> Result<&FileCollectionSnapshot> {
        self.input_snapshot
            .get_or_try_init(|| -> Result<_> { Ok(self.snapshotter.snapshot(&self.inputs)?) })
    }

    /// Current outputs, rehashing only files whose metadata differs from the recorded outputs.
    fn outputs_before(&self) -> Result<&SnapshotCollection> {
        self.outputs_before.get_or_try_init(|| -> Result<_> {
            let previous = self.previous_outputs()?;
            Ok(self.snapshotter.snapshot_reusing(&self.outputs, previous)?)
        })
    }

    fn previous_inputs(&self) -> Result<&SnapshotCollection> {
        self.previous_inputs
            .get_or_try_init(|| self.recorded_snapshot(|record| &record.input_snapshot))
    }

    fn previous_outputs(&self) -> Result<&SnapshotCollection> {
        self.previous_outputs
            .get_or_try_init(|| self.recorded_snapshot(|record| &record.output_snapshot))
    }

    /// Loads one of the matched record's snapshots. A snapshot missing from the repository reads
    /// as empty, which reports every current file as added.
    fn recorded_snapshot(&self, select: impl FnOnce(&ExecutionRecord) -> &SnapshotRef) -> Result<SnapshotCollection> {
        let Some(record) = self.matched_record() else {
            return Ok(SnapshotCollection::empty());
        };
        match self.store.snapshot(select(record)) {
            Ok(collection) => Ok(collection),
            Err(HistoryError::MissingSnapshot { id }) => {
                tracing::debug!(target = "keel.uptodate", id, "recorded snapshot is missing; treating as empty");
                Ok(SnapshotCollection::empty())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Consumes an up-to-date evaluation, bringing the matched record in line with what was
    /// observed: fingerprints that changed without a content change are updated so the next
    /// check takes the fast path again.
    pub fn into_up_to_date_history(mut self) -> ExecutionHistory {
        let Some(idx) = self.matched else {
            return self.history;
        };
        let input_hash = self.inputs.hash();
        let output_hash = self.outputs.hash();
        let Some(record) = self.history.record(idx) else {
            return self.history;
        };
        let stale = record.input_hash != input_hash
            || record.output_hash != output_hash
            || record.output_signatures != self.output_signatures;
        if stale {
            tracing::debug!(
                target = "keel.uptodate",
                key = self.history.key(),
                "refreshing fingerprints of up-to-date record"
            );
            if let Some(record) = self.history.record_mut(idx) {
                record.input_hash = input_hash;
                record.output_hash = output_hash;
                record.output_signatures = std::mem::take(&mut self.output_signatures);
            }
        }
        self.history
    }

    /// Captures the state right after `work` executed and builds its new execution record.
    ///
    /// Output files are rehashed only where their metadata differs from the outputs observed
    /// before execution.
    pub fn record_execution(self, work: &dyn WorkItem) -> Result<(ExecutionHistory, ExecutionRecord)> {
        let inputs_after = self.snapshotter.precheck(&work.declared_inputs())?;
        let input_snapshot = match (self.matched_record(), self.input_snapshot.get()) {
            (_, Some(snapshot)) if inputs_after.hash() == self.inputs.hash() => {
                SnapshotRef::Unsaved(snapshot.clone())
            }
            (Some(record), _) if inputs_after.hash() == record.input_hash => record.input_snapshot.clone(),
            _ => SnapshotRef::Unsaved(self.snapshotter.snapshot(&inputs_after)?),
        };

        let outputs_after = self.snapshotter.precheck_fresh(&work.declared_outputs())?;
        let baseline = match self.outputs_before.get() {
            Some(collection) => collection.clone(),
            None => self.previous_outputs()?.clone(),
        };
        let outputs = self.snapshotter.snapshot_reusing(&outputs_after, &baseline)?;

        let record = ExecutionRecord {
            work_type: self.work_type,
            input_hash: inputs_after.hash(),
            output_hash: outputs_after.hash(),
            output_signatures: self.output_signatures,
            input_properties: self.properties,
            input_snapshot,
            output_snapshot: SnapshotRef::Unsaved(outputs.into()),
        };
        Ok((self.history, record))
    }
}

fn lazy_diff<'a>(
    load: impl FnOnce() -> Result<(&'a SnapshotCollection, &'a SnapshotCollection)> + 'a,
    wrap: fn(FileChange) -> ChangeReason,
) -> ChangeIter<'a> {
    Box::new(iter::once_with(load).flat_map(move |loaded| -> ChangeIter<'a> {
        match loaded {
            Ok((current, previous)) => Box::new(
                current
                    .diff(previous, CompareMode::Content)
                    .changes()
                    .map(move |change| Ok(wrap(change))),
            ),
            Err(err) => Box::new(iter::once(Err(err))),
        }
    }))
}
