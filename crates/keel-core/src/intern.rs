use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Thread-safe string table used to deduplicate absolute paths.
///
/// Thousands of work items routinely reference overlapping directory trees; routing every
/// snapshot path through one table keeps a single allocation per distinct path no matter how
/// many collections mention it.
#[derive(Debug, Default)]
pub struct PathInterner {
    table: RwLock<HashSet<Arc<str>>>,
}

impl PathInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared copy of `path`, inserting it on first use.
    pub fn intern(&self, path: &str) -> Arc<str> {
        if let Some(existing) = self.table.read().get(path) {
            return existing.clone();
        }

        let mut table = self.table.write();
        // Another thread may have inserted between the read and write locks.
        if let Some(existing) = table.get(path) {
            return existing.clone();
        }
        let interned: Arc<str> = Arc::from(path);
        table.insert(interned.clone());
        interned
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Drops every entry. Outstanding `Arc<str>` handles stay valid.
    pub fn clear(&self) {
        self.table.write().clear();
    }
}
