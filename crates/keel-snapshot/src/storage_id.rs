use parking_lot::Mutex;

/// A persistent-store id that is assigned at most once.
///
/// Trees and collections observed by several work items in the same build are stored under a
/// single id; the mutex makes concurrent first stores of the *same* value serialize while stores
/// of unrelated values never contend.
#[derive(Debug, Default)]
pub struct StorageId {
    id: Mutex<Option<i64>>,
}

impl StorageId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assigned(id: i64) -> Self {
        Self {
            id: Mutex::new(Some(id)),
        }
    }

    pub fn get(&self) -> Option<i64> {
        *self.id.lock()
    }

    /// Returns the assigned id, running `assign` (under the per-value lock) when there is none.
    ///
    /// A failed `assign` leaves the id unassigned so a later call can retry.
    pub fn get_or_try_assign<E>(&self, assign: impl FnOnce() -> Result<i64, E>) -> Result<i64, E> {
        let mut guard = self.id.lock();
        if let Some(id) = *guard {
            return Ok(id);
        }
        let id = assign()?;
        *guard = Some(id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn assigns_only_once_under_contention() {
        let storage_id = Arc::new(StorageId::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let storage_id = storage_id.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    storage_id
                        .get_or_try_assign(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ()>(42)
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_assignment_can_be_retried() {
        let storage_id = StorageId::new();
        assert!(storage_id.get_or_try_assign(|| Err("disk full")).is_err());
        assert_eq!(storage_id.get(), None);
        assert_eq!(storage_id.get_or_try_assign(|| Ok::<_, ()>(7)), Ok(7));
        assert_eq!(storage_id.get(), Some(7));
    }
}
