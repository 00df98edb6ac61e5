//! Windows watch driver on `ReadDirectoryChangesW`.
//!
//! One overlapped read loop per subscription covers the whole root
//! recursively. Renames arrive as an OLD_NAME/NEW_NAME action pair within a
//! single buffer; identity uses the NTFS 64-bit file reference (`file_id`)
//! rather than an inode number.

use std::ffi::OsString;
use std::fs;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, warn};
use parking_lot::Mutex;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE,
    FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

use super::brute_force;
use crate::error::{Result, WatcherError};
use crate::tree::{self, DirTree};
use crate::watcher::Watcher;

/// Wakeup interval for observing the shutdown flag while the kernel is
/// quiet.
const WAIT_TIMEOUT_MS: u32 = 500;

const READ_BUFFER_SIZE: usize = 64 * 1024;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION;

/// A raw handle that travels with its watch thread.
///
/// Safety: the handle is only used by the watch thread plus one
/// `CancelIoEx` call at shutdown, both of which the API permits
/// cross-thread.
#[derive(Clone, Copy)]
struct SendableHandle(HANDLE);
unsafe impl Send for SendableHandle {}
unsafe impl Sync for SendableHandle {}

struct WinSubscription {
    watcher: Arc<Watcher>,
    shutdown: Arc<AtomicBool>,
    directory: SendableHandle,
    thread: Option<JoinHandle<()>>,
}

pub(crate) struct WindowsBackend {
    state: Mutex<Vec<WinSubscription>>,
}

impl WindowsBackend {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            state: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn subscribe(&self, watcher: Arc<Watcher>) -> Result<()> {
        let tree = DirTree::cached(watcher.root(), true);
        if !tree.is_complete() {
            brute_force::read_tree(&tree, &watcher)?;
        }

        let mut state = self.state.lock();
        let directory = open_directory(watcher.root())?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_watcher = watcher.clone();
        let thread_shutdown = shutdown.clone();
        let thread = thread::Builder::new()
            .name("treewatch-windows".into())
            .spawn(move || run(directory, tree, thread_watcher, thread_shutdown))
            .map_err(|error| WatcherError::Watch(format!("watch thread spawn failed: {error}")))?;

        state.push(WinSubscription {
            watcher,
            shutdown,
            directory,
            thread: Some(thread),
        });
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        let mut state = self.state.lock();
        let mut kept = Vec::with_capacity(state.len());
        for mut sub in state.drain(..) {
            if Arc::ptr_eq(&sub.watcher, watcher) {
                sub.shutdown.store(true, Ordering::SeqCst);
                unsafe {
                    CancelIoEx(sub.directory.0, std::ptr::null());
                }
                if let Some(handle) = sub.thread.take() {
                    let _ = handle.join();
                }
            } else {
                kept.push(sub);
            }
        }
        *state = kept;
        Ok(())
    }
}

fn open_directory(root: &Path) -> Result<SendableHandle> {
    let mut wide: Vec<u16> = root.as_os_str().encode_wide().collect();
    wide.push(0);
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            std::ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(WatcherError::Watch(format!(
            "failed to open {} for watching (error {})",
            root.display(),
            unsafe { GetLastError() }
        )));
    }
    Ok(SendableHandle(handle))
}

fn run(directory: SendableHandle, dir_tree: Arc<DirTree>, watcher: Arc<Watcher>, shutdown: Arc<AtomicBool>) {
    let completion = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
    if completion.is_null() {
        error!("failed to create completion event; watch thread exiting");
        watcher.deliver_error(WatcherError::Watch("completion event creation failed".into()));
        unsafe { CloseHandle(directory.0) };
        return;
    }

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    // Destination of the OLD_NAME half of a rename, waiting for NEW_NAME.
    let mut pending_rename: Option<PathBuf> = None;

    'outer: loop {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        overlapped.hEvent = completion;
        let ok = unsafe {
            ReadDirectoryChangesW(
                directory.0,
                buffer.as_mut_ptr() as *mut _,
                buffer.len() as u32,
                1,
                NOTIFY_FILTER,
                std::ptr::null_mut(),
                &mut overlapped,
                None,
            )
        };
        if ok == 0 {
            let message = format!("ReadDirectoryChangesW failed (error {})", unsafe {
                GetLastError()
            });
            error!("{message}");
            watcher.deliver_error(WatcherError::Watch(message));
            break;
        }

        let mut transferred: u32 = 0;
        loop {
            match unsafe { WaitForSingleObject(completion, WAIT_TIMEOUT_MS) } {
                WAIT_OBJECT_0 => break,
                WAIT_TIMEOUT => {
                    if shutdown.load(Ordering::SeqCst) {
                        break 'outer;
                    }
                }
                _ => {
                    watcher.deliver_error(WatcherError::Watch("wait on completion failed".into()));
                    break 'outer;
                }
            }
        }
        let ok =
            unsafe { GetOverlappedResult(directory.0, &overlapped, &mut transferred, 0) };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if ok == 0 {
            let message = format!("overlapped read failed (error {})", unsafe { GetLastError() });
            error!("{message}");
            watcher.deliver_error(WatcherError::Watch(message));
            break;
        }
        if transferred == 0 {
            // The kernel buffer overflowed; changes were dropped.
            warn!("change buffer overflowed for {}", watcher.root().display());
            continue;
        }

        let mut offset = 0usize;
        loop {
            let record = unsafe {
                &*(buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION)
            };
            let name_len = record.FileNameLength as usize / 2;
            let name_ptr = unsafe {
                std::slice::from_raw_parts(record.FileName.as_ptr(), name_len)
            };
            let relative = OsString::from_wide(name_ptr);
            let path = watcher.root().join(relative);

            process_record(&dir_tree, &watcher, record.Action, path, &mut pending_rename);

            if record.NextEntryOffset == 0 {
                break;
            }
            offset += record.NextEntryOffset as usize;
        }

        watcher.notify();
    }

    unsafe {
        CloseHandle(completion);
        CloseHandle(directory.0);
    }
}

fn process_record(
    dir_tree: &Arc<DirTree>,
    watcher: &Arc<Watcher>,
    action: u32,
    path: PathBuf,
    pending_rename: &mut Option<PathBuf>,
) {
    if watcher.is_ignored(&path) {
        return;
    }
    let events = watcher.events();

    match action {
        FILE_ACTION_ADDED => {
            let Ok(meta) = fs::symlink_metadata(&path) else {
                return;
            };
            let is_dir = meta.is_dir();
            let file_id = brute_force::file_id_of(&path);
            let entry = dir_tree.add(&path, tree::FAKE_INO, tree::mtime_nanos(&meta), is_dir, &file_id);
            events.create(&path, entry.is_dir, tree::FAKE_INO, &file_id);
        }
        FILE_ACTION_REMOVED => {
            let prev = dir_tree.find(&path);
            let is_dir = prev.as_ref().map(|e| e.is_dir).unwrap_or(false);
            let file_id = prev.map(|e| e.file_id).unwrap_or_default();
            dir_tree.remove(&path);
            events.remove(&path, is_dir, tree::FAKE_INO, &file_id);
        }
        FILE_ACTION_MODIFIED => {
            let Ok(meta) = fs::symlink_metadata(&path) else {
                return;
            };
            let file_id = brute_force::file_id_of(&path);
            dir_tree.update(&path, tree::FAKE_INO, tree::mtime_nanos(&meta), &file_id);
            events.update(&path, tree::FAKE_INO, &file_id);
        }
        FILE_ACTION_RENAMED_OLD_NAME => {
            *pending_rename = Some(path);
        }
        FILE_ACTION_RENAMED_NEW_NAME => {
            let Some(old_path) = pending_rename.take() else {
                // NEW_NAME without its pair: treat as an appearance.
                let Ok(meta) = fs::symlink_metadata(&path) else {
                    return;
                };
                let file_id = brute_force::file_id_of(&path);
                dir_tree.add(&path, tree::FAKE_INO, tree::mtime_nanos(&meta), meta.is_dir(), &file_id);
                events.create(&path, meta.is_dir(), tree::FAKE_INO, &file_id);
                return;
            };
            let Ok(meta) = fs::symlink_metadata(&path) else {
                return;
            };
            let is_dir = meta.is_dir();
            let file_id = brute_force::file_id_of(&path);
            dir_tree.remove(&old_path);
            if is_dir {
                dir_tree.rewrite_prefix(&old_path, &path);
            }
            dir_tree.add(&path, tree::FAKE_INO, tree::mtime_nanos(&meta), is_dir, &file_id);
            events.rename(&old_path, &path, is_dir, tree::FAKE_INO, &file_id);
        }
        other => {
            warn!("unknown change action {other} for {}", path.display());
        }
    }
}
