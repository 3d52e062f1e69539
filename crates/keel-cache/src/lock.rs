use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use fs2::FileExt as _;

use crate::error::CacheError;

/// Sequence number stored in the lock file. It advances every time a holder of the lock modified
/// the store, so a process can tell whether anyone wrote since it last looked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockStateToken(u64);

impl LockStateToken {
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(self) -> u64 {
        self.0
    }
}

/// An exclusive lock on the store, shared safely between threads and processes.
///
/// `fs2` locks are per process on Unix, so threads of the same process additionally serialize on
/// an in-process mutex registered per lock path. Dropping the value releases both.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
    _guard: MutexGuard<'static, ()>,
}

impl CacheLock {
    /// Blocks until the lock at `path` is held, creating the lock file if needed.
    pub fn lock_exclusive(path: &Path) -> Result<Self, CacheError> {
        let guard = process_lock_for_path(path)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current state token. An empty (freshly created) lock file reads as sequence 0.
    pub fn state_token(&mut self) -> io::Result<LockStateToken> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(8);
        (&mut self.file).take(8).read_to_end(&mut buf)?;
        let sequence = match <[u8; 8]>::try_from(buf.as_slice()) {
            Ok(bytes) => u64::from_le_bytes(bytes),
            Err(_) => 0,
        };
        Ok(LockStateToken(sequence))
    }

    /// Advances the state token after a modification and returns the new value.
    pub fn advance_state(&mut self) -> io::Result<LockStateToken> {
        let next = LockStateToken(self.state_token()?.0.wrapping_add(1));
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&next.0.to_le_bytes())?;
        self.file.set_len(8)?;
        self.file.sync_data()?;
        Ok(next)
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let mut locks = PROCESS_LOCKS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *locks
        .entry(path.to_path_buf())
        .or_insert_with(|| &*Box::leak(Box::new(Mutex::new(()))))
}
