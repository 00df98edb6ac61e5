//! Portable fallback driver: recursive scans instead of kernel
//! notifications. Subscription mode is not available here, but scans and
//! the whole snapshot workflow are implemented directly on tree
//! operations, and the native drivers borrow the walker to populate an
//! incomplete tree at subscribe time.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::Result;
use crate::snapshot;
use crate::tree::{self, DirTree};
use crate::watcher::Watcher;

/// Fills `tree` with everything under its root, pruning ignored subtrees.
/// Symlinks are recorded from their own metadata and never followed.
pub(crate) fn read_tree(tree: &DirTree, watcher: &Watcher) -> Result<()> {
    walk_into(tree, watcher, tree.root())?;
    tree.set_complete();
    Ok(())
}

fn walk_into(tree: &DirTree, watcher: &Watcher, dir: &Path) -> Result<()> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(error) => {
            if dir == tree.root() {
                return Err(error.into());
            }
            // A subtree may vanish or deny access mid-walk.
            warn!("skipping unreadable directory {}: {error}", dir.display());
            return Ok(());
        }
    };

    let mut children: Vec<PathBuf> = reader
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    children.sort();

    for child in children {
        if watcher.is_ignored(&child) {
            continue;
        }
        let Ok(meta) = fs::symlink_metadata(&child) else {
            continue;
        };
        let is_dir = meta.is_dir();
        tree.add(
            &child,
            tree::inode_of(&meta),
            tree::mtime_nanos(&meta),
            is_dir,
            &file_id_of(&child),
        );
        if is_dir {
            walk_into(tree, watcher, &child)?;
        }
    }
    Ok(())
}

/// One-shot scan: a create event per existing entry under the root.
pub(crate) fn scan(watcher: &Watcher) -> Result<()> {
    let current = DirTree::new(watcher.root().to_path_buf(), true);
    read_tree(&current, watcher)?;
    for entry in current.entries() {
        watcher
            .events()
            .create(&entry.path, entry.is_dir, entry.ino, &entry.file_id);
    }
    Ok(())
}

/// Materializes the current tree state to `snapshot_path`.
pub(crate) fn write_snapshot(watcher: &Watcher, snapshot_path: &Path) -> Result<()> {
    let current = DirTree::new(watcher.root().to_path_buf(), true);
    read_tree(&current, watcher)?;
    snapshot::write_to_path(&current, snapshot_path)
}

/// Loads the snapshot, reads the live tree, and appends the reconciling
/// events to the watcher's log.
pub(crate) fn events_since(watcher: &Watcher, snapshot_path: &Path) -> Result<()> {
    let prior = snapshot::load_from_path(watcher.root(), snapshot_path)?;
    let current = DirTree::new(watcher.root().to_path_buf(), true);
    read_tree(&current, watcher)?;
    current.get_changes(&prior, watcher.events());
    Ok(())
}

/// NTFS file reference for `path`, empty elsewhere (and on open failure).
#[cfg(windows)]
pub(crate) fn file_id_of(path: &Path) -> String {
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::{
        GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION, FILE_FLAG_BACKUP_SEMANTICS,
    };

    let Ok(file) = fs::OpenOptions::new()
        .access_mode(0)
        .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
        .open(path)
    else {
        return String::new();
    };
    let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
    let ok = unsafe { GetFileInformationByHandle(file.as_raw_handle() as _, &mut info) };
    if ok == 0 {
        return String::new();
    }
    let reference = (u64::from(info.nFileIndexHigh) << 32) | u64::from(info.nFileIndexLow);
    format!("{}:{}", info.dwVolumeSerialNumber, reference)
}

#[cfg(not(windows))]
pub(crate) fn file_id_of(_path: &Path) -> String {
    String::new()
}
