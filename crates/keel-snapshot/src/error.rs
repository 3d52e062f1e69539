use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors produced while walking or hashing declared files.
///
/// Every variant carries the offending path: a partial snapshot is never returned.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("invalid file pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
