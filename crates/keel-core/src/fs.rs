use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Modification time of `metadata` in milliseconds since the Unix epoch.
///
/// Platforms that cannot report an mtime, or report one before the epoch, yield `0`.
pub fn modified_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Makes `path` absolute without touching the filesystem (symlinks are not resolved).
pub fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::path::absolute(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_millis_is_positive_for_fresh_files() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::metadata(&file).unwrap();
        assert!(modified_millis(&meta) > 0);
    }

    #[test]
    fn absolute_path_keeps_absolute_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(absolute_path(tmp.path()).unwrap(), tmp.path());
        assert!(absolute_path(Path::new("rel/x")).unwrap().is_absolute());
    }
}
