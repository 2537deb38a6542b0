//! Filesystem helpers shared by the client and server glue.

use std::path::{Path, PathBuf};

/// Removes a partially written file unless the transfer completed.
///
/// Holding the path in a drop guard covers every abort path, including the
/// enclosing task being cancelled.
pub(crate) struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    /// The transfer completed; the file stays.
    pub(crate) fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Bytes available to new files on the filesystem holding `path`.
pub(crate) fn available_space(path: &Path) -> std::io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_removes_unless_kept() {
        let dir = tempfile::tempdir().unwrap();

        let removed = dir.path().join("partial");
        std::fs::write(&removed, b"half").unwrap();
        drop(PartialFile::new(removed.clone()));
        assert!(!removed.exists());

        let kept = dir.path().join("done");
        std::fs::write(&kept, b"all").unwrap();
        let mut guard = PartialFile::new(kept.clone());
        guard.keep();
        drop(guard);
        assert!(kept.exists());
    }

    #[test]
    fn available_space_reports_something() {
        let space = available_space(Path::new(".")).unwrap();
        assert!(space > 0);
    }
}
