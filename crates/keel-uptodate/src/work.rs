use std::path::PathBuf;

use keel_snapshot::{FileChange, FileSet, WorkNode};

/// A unit of work whose outputs may be reused across builds.
pub trait WorkItem: Send + Sync {
    /// Identity of the item within the build; histories are keyed by it.
    fn path(&self) -> &str;

    fn work_type(&self) -> &str;

    fn declared_inputs(&self) -> FileSet;

    fn declared_outputs(&self) -> FileSet;

    /// Non-file inputs, in declaration order.
    fn declared_properties(&self) -> Vec<(String, serde_json::Value)> {
        Vec::new()
    }

    /// `false` when the item only learns what it reads while it runs.
    fn has_known_inputs(&self) -> bool {
        true
    }

    /// `false` when the item only learns what it writes while it runs.
    fn has_known_outputs(&self) -> bool {
        true
    }

    /// Runs the work. Returns whether anything was done.
    fn execute(&self, changes: &InputChanges) -> anyhow::Result<bool>;
}

/// What an executing work item is told about its inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputChanges {
    incremental: bool,
    changes: Vec<FileChange>,
}

impl InputChanges {
    pub fn full_rebuild() -> Self {
        Self::default()
    }

    pub fn incremental(changes: Vec<FileChange>) -> Self {
        Self {
            incremental: true,
            changes,
        }
    }

    /// `false` means every input must be treated as changed.
    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub fn file_changes(&self) -> &[FileChange] {
        &self.changes
    }
}

/// The finalized set of work items of one build, in execution order.
pub trait WorkGraph {
    fn nodes(&self) -> Vec<WorkNode>;
}

impl WorkGraph for [WorkNode] {
    fn nodes(&self) -> Vec<WorkNode> {
        self.to_vec()
    }
}

impl WorkGraph for [&dyn WorkItem] {
    fn nodes(&self) -> Vec<WorkNode> {
        self.iter().map(|work| work_node(*work)).collect()
    }
}

/// Describes `work` for the tree-cache eligibility analysis.
pub fn work_node(work: &dyn WorkItem) -> WorkNode {
    let inputs = work.has_known_inputs().then(|| absolute_roots(&work.declared_inputs()));
    let outputs = work
        .has_known_outputs()
        .then(|| absolute_roots(&work.declared_outputs()));
    WorkNode::new(work.path(), inputs, outputs)
}

fn absolute_roots(files: &FileSet) -> Vec<PathBuf> {
    files
        .root_paths()
        .map(|path| keel_core::absolute_path(path).unwrap_or_else(|_| path.to_path_buf()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Opaque;

    impl WorkItem for Opaque {
        fn path(&self) -> &str {
            ":opaque"
        }

        fn work_type(&self) -> &str {
            "Exec"
        }

        fn declared_inputs(&self) -> FileSet {
            FileSet::new().tree("/src")
        }

        fn declared_outputs(&self) -> FileSet {
            FileSet::new().file("/out/a.bin")
        }

        fn has_known_inputs(&self) -> bool {
            false
        }

        fn execute(&self, _changes: &InputChanges) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn unknown_inputs_have_no_paths() {
        let node = work_node(&Opaque);
        assert_eq!(node.id, ":opaque");
        assert_eq!(node.inputs, None);
        assert_eq!(node.outputs, Some(vec![PathBuf::from("/out/a.bin")]));
    }

    #[test]
    fn graphs_of_items_list_nodes_in_order() {
        let items: [&dyn WorkItem; 2] = [&Opaque, &Opaque];
        assert_eq!(items[..].nodes().len(), 2);
    }
}
