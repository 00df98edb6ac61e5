//! A single filesystem object as the tree records it.

use std::fs::Metadata;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

/// Sentinel inode number meaning "unknown".
pub const FAKE_INO: u64 = 0;

/// Sentinel file id meaning "unused". Only Windows populates file ids.
pub const FAKE_FILE_ID: &str = "";

/// One filesystem object under a watched root.
///
/// Identity comparison prefers `file_id` when populated, then `ino`, then
/// the path itself. Symlinks are recorded with `is_dir == false` regardless
/// of their target: metadata is always taken without following links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Absolute path, canonicalized at root-resolution time.
    pub path: PathBuf,
    /// Inode number, `FAKE_INO` when unknown.
    pub ino: u64,
    /// Windows file reference, empty when unused.
    pub file_id: String,
    /// Modification time in nanoseconds since the epoch.
    pub mtime: u64,
    /// True for directories; files and symlinks are false.
    pub is_dir: bool,
}

impl DirEntry {
    pub fn new(path: PathBuf, ino: u64, mtime: u64, is_dir: bool, file_id: &str) -> Self {
        Self {
            path,
            ino,
            file_id: file_id.to_string(),
            mtime,
            is_dir,
        }
    }
}

/// Modification time of `meta` in nanoseconds since the epoch.
///
/// Pre-epoch or missing mtimes collapse to zero rather than failing: a
/// snapshot diff treats them as "mtime unknown" and still matches by
/// identity.
pub(crate) fn mtime_nanos(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Inode number of `meta`, `FAKE_INO` on platforms without inodes.
pub(crate) fn inode_of(meta: &Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        FAKE_INO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symlink_metadata_does_not_follow() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        #[cfg(unix)]
        {
            let link = dir.path().join("link");
            std::os::unix::fs::symlink(&target, &link).unwrap();
            let meta = std::fs::symlink_metadata(&link).unwrap();
            assert!(!meta.is_dir());
            assert_ne!(inode_of(&meta), FAKE_INO);
        }
    }

    #[test]
    fn mtime_is_nanoseconds() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();
        // Any filesystem younger than 2001 reports well past 1e18 ns.
        assert!(mtime_nanos(&meta) > 1_000_000_000_000_000_000);
    }
}
