use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A scheduled work item as seen by the tree-cache eligibility analysis.
///
/// `None` means the item's inputs (or outputs) cannot be known ahead of execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkNode {
    pub id: String,
    pub inputs: Option<Vec<PathBuf>>,
    pub outputs: Option<Vec<PathBuf>>,
}

impl WorkNode {
    pub fn new(id: impl Into<String>, inputs: Option<Vec<PathBuf>>, outputs: Option<Vec<PathBuf>>) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
        }
    }
}

/// Which directory roots are worth keeping in the [`TreeScanCache`](crate::TreeScanCache) for
/// one build, and when to drop them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeCachePlan {
    cacheable: HashSet<PathBuf>,
    invalidate_after: HashMap<String, Vec<PathBuf>>,
    flush_before: HashSet<String>,
    flush_after: HashSet<String>,
}

impl TreeCachePlan {
    /// Analyzes work items in execution order.
    ///
    /// A root is cacheable when at least two items consume it or when a different item produces
    /// it. Roots that nest with any declared output (one inside the other) are never cached, nor
    /// are outputs claimed by several items. Each cacheable root is invalidated after the last item
    /// that reads or writes it.
    pub fn analyze(nodes: &[WorkNode]) -> Self {
        let mut plan = TreeCachePlan::default();
        let mut consumers: HashMap<&Path, Vec<usize>> = HashMap::new();
        let mut producers: HashMap<&Path, HashSet<usize>> = HashMap::new();

        for (idx, node) in nodes.iter().enumerate() {
            match &node.inputs {
                Some(inputs) => {
                    let unique: HashSet<&Path> = inputs.iter().map(PathBuf::as_path).collect();
                    for input in unique {
                        consumers.entry(input).or_default().push(idx);
                    }
                }
                None => {
                    plan.flush_before.insert(node.id.clone());
                }
            }
            match &node.outputs {
                Some(outputs) => {
                    for output in outputs {
                        producers.entry(output.as_path()).or_default().insert(idx);
                    }
                }
                None => {
                    plan.flush_after.insert(node.id.clone());
                }
            }
        }

        let contested = contested_outputs(&producers);
        let enclosing: HashSet<&Path> = producers
            .keys()
            .flat_map(|output| output.ancestors().skip(1))
            .collect();

        for (path, readers) in &consumers {
            let owners = producers.get(path);
            let produced_elsewhere = owners.is_some_and(|owners| owners.iter().any(|owner| !readers.contains(owner)));
            if readers.len() < 2 && !produced_elsewhere {
                continue;
            }
            let nested = enclosing.contains(path) || path.ancestors().skip(1).any(|parent| producers.contains_key(parent));
            if nested || contested.contains(path) {
                continue;
            }
            plan.cacheable.insert(path.to_path_buf());
            // A producer running after the last reader would otherwise re-insert a walk nobody needs.
            let last = readers
                .iter()
                .chain(owners.into_iter().flatten())
                .copied()
                .max();
            if let Some(last) = last {
                plan.invalidate_after
                    .entry(nodes[last].id.clone())
                    .or_default()
                    .push(path.to_path_buf());
            }
        }

        tracing::debug!(
            target = "keel.snapshot",
            work_items = nodes.len(),
            cacheable = plan.cacheable.len(),
            contested = contested.len(),
            "analyzed tree cache eligibility"
        );
        plan
    }

    pub fn is_cacheable(&self, root: &Path) -> bool {
        self.cacheable.contains(root)
    }

    pub fn cacheable_roots(&self) -> impl Iterator<Item = &Path> + '_ {
        self.cacheable.iter().map(PathBuf::as_path)
    }

    pub fn invalidations_after(&self, work_id: &str) -> &[PathBuf] {
        self.invalidate_after
            .get(work_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn flushes_before(&self, work_id: &str) -> bool {
        self.flush_before.contains(work_id)
    }

    pub fn flushes_after(&self, work_id: &str) -> bool {
        self.flush_after.contains(work_id)
    }
}

fn contested_outputs<'a>(producers: &HashMap<&'a Path, HashSet<usize>>) -> HashSet<&'a Path> {
    producers
        .iter()
        .filter(|(_, owners)| owners.len() > 1)
        .map(|(&path, _)| path)
        .collect()
}
