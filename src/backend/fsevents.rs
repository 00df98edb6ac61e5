//! macOS watch driver on the Core Services FSEvents API.
//!
//! FSEvents delivers one recursive stream per root with per-path flag sets
//! that describe what *might* have happened. Each reported path is re-read
//! with `symlink_metadata` and reconciled against the tree to decide the
//! logical event; a removal and an appearance of the same inode within one
//! drain pair up into a rename.
//!
//! Each subscription owns a watch thread that builds its stream, hands its
//! run loop back over a channel, and parks in `CFRunLoopRun`. The stream
//! callback borrows a `StreamContext` that lives on that thread's stack for
//! the whole run, so no reference counting crosses the FFI boundary.
//! Stopping the run loop unwinds the stream and ends the thread; dropping
//! the stream handle joins it.

use std::ffi::CStr;
use std::fs;
use std::os::raw::{c_char, c_void};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use core_foundation_sys::array::{kCFTypeArrayCallBacks, CFArrayCreate, CFArrayRef};
use core_foundation_sys::base::{kCFAllocatorDefault, CFIndex, CFRelease};
use core_foundation_sys::runloop::{
    kCFRunLoopDefaultMode, CFRunLoopGetCurrent, CFRunLoopRef, CFRunLoopRun, CFRunLoopStop,
};
use core_foundation_sys::string::{kCFStringEncodingUTF8, CFStringCreateWithBytes, CFStringRef};
use log::{debug, error, warn};
use parking_lot::Mutex;

use super::brute_force;
use crate::error::{Result, WatcherError};
use crate::tree::{self, DirEntry, DirTree};
use crate::watcher::Watcher;

type FSEventStreamRef = *mut c_void;
type FSEventStreamEventId = u64;

type StreamCallback = extern "C" fn(
    stream_ref: FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const FSEventStreamEventId,
);

/// Layout fixed by the C API.
#[repr(C)]
struct FSEventStreamContext {
    version: CFIndex,
    info: *mut c_void,
    retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
    release: Option<extern "C" fn(*const c_void)>,
    copy_description: Option<extern "C" fn(*const c_void) -> CFStringRef>,
}

// kFSEventStreamCreateFlag{NoDefer, WatchRoot, FileEvents}
const CREATE_NO_DEFER: u32 = 0x02;
const CREATE_WATCH_ROOT: u32 = 0x04;
const CREATE_FILE_EVENTS: u32 = 0x10;

// kFSEventStreamEventIdSinceNow
const SINCE_NOW: FSEventStreamEventId = u64::MAX;

/// Batching latency in seconds before the kernel flushes a callback.
const STREAM_LATENCY: f64 = 0.05;

#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn FSEventStreamCreate(
        allocator: *const c_void,
        callback: StreamCallback,
        context: *mut FSEventStreamContext,
        paths_to_watch: CFArrayRef,
        since_when: FSEventStreamEventId,
        latency: f64,
        flags: u32,
    ) -> FSEventStreamRef;

    fn FSEventStreamScheduleWithRunLoop(
        stream: FSEventStreamRef,
        run_loop: CFRunLoopRef,
        run_loop_mode: CFStringRef,
    );

    fn FSEventStreamStart(stream: FSEventStreamRef) -> bool;
    fn FSEventStreamStop(stream: FSEventStreamRef);
    fn FSEventStreamInvalidate(stream: FSEventStreamRef);
    fn FSEventStreamRelease(stream: FSEventStreamRef);

    fn FSEventStreamSetExclusionPaths(stream: FSEventStreamRef, paths: CFArrayRef) -> bool;
}

bitflags! {
    /// The stream flags this driver acts on. Item-level bits are ignored;
    /// the on-disk state is re-read instead of trusted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StreamFlags: u32 {
        const MUST_SCAN_SUBDIRS = 0x0000_0001;
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        const HISTORY_DONE      = 0x0000_0010;
        const ROOT_CHANGED      = 0x0000_0020;
    }
}

/// One raw record out of the stream callback.
struct RawEvent {
    path: PathBuf,
    flags: StreamFlags,
}

/// What the stream callback works against. Lives on the watch thread's
/// stack for as long as the stream is scheduled.
struct StreamContext {
    watcher: Arc<Watcher>,
    tree: Arc<DirTree>,
}

/// A `CFRunLoopRef` sent back from the watch thread so the owner can stop
/// it. `CFRunLoopStop` is documented as callable from any thread.
struct RunLoopHandle(CFRunLoopRef);
unsafe impl Send for RunLoopHandle {}

/// Owns one stream's watch thread; dropping stops the run loop and joins.
struct FsEventStream {
    run_loop: RunLoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl FsEventStream {
    fn spawn(watcher: Arc<Watcher>, tree: Arc<DirTree>) -> Result<Self> {
        let root = watcher.root().to_string_lossy().into_owned();
        let exclusions: Vec<String> = watcher
            .ignored_roots()
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name("treewatch-fsevents".into())
            .spawn(move || {
                let context = StreamContext { watcher, tree };
                unsafe { drive_stream(&root, &exclusions, &context, ready_tx) };
            })
            .map_err(|error| WatcherError::Watch(format!("watch thread spawn failed: {error}")))?;

        // The thread sends its run loop once the stream is live; a closed
        // channel means stream setup failed and the thread is gone.
        match ready_rx.recv() {
            Ok(run_loop) => Ok(Self {
                run_loop,
                thread: Some(thread),
            }),
            Err(_) => {
                let _ = thread.join();
                Err(WatcherError::Watch(
                    "failed to start the FSEvents stream".into(),
                ))
            }
        }
    }
}

impl Drop for FsEventStream {
    fn drop(&mut self) {
        unsafe { CFRunLoopStop(self.run_loop.0) };
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Body of the watch thread. Builds and schedules the stream, reports the
/// run loop, and blocks until the run loop is stopped.
///
/// Safety: called once per thread; `context` must outlive the call, which
/// it does as the caller's stack local.
unsafe fn drive_stream(
    root: &str,
    exclusions: &[String],
    context: &StreamContext,
    ready_tx: crossbeam_channel::Sender<RunLoopHandle>,
) {
    let mut stream_context = FSEventStreamContext {
        version: 0,
        info: context as *const StreamContext as *mut c_void,
        retain: None,
        release: None,
        copy_description: None,
    };

    let watch_paths = cf_path_array(std::slice::from_ref(&root.to_owned()));
    let stream = FSEventStreamCreate(
        kCFAllocatorDefault,
        stream_callback,
        &mut stream_context,
        watch_paths,
        SINCE_NOW,
        STREAM_LATENCY,
        CREATE_NO_DEFER | CREATE_WATCH_ROOT | CREATE_FILE_EVENTS,
    );
    CFRelease(watch_paths as *const c_void);
    if stream.is_null() {
        error!("could not create an event stream for {root}");
        return;
    }

    if !exclusions.is_empty() {
        let exclusion_array = cf_path_array(exclusions);
        FSEventStreamSetExclusionPaths(stream, exclusion_array);
        CFRelease(exclusion_array as *const c_void);
    }

    let run_loop = CFRunLoopGetCurrent();
    FSEventStreamScheduleWithRunLoop(stream, run_loop, kCFRunLoopDefaultMode);
    if !FSEventStreamStart(stream) {
        error!("could not start the event stream for {root}");
        FSEventStreamInvalidate(stream);
        FSEventStreamRelease(stream);
        return;
    }
    if ready_tx.send(RunLoopHandle(run_loop)).is_err() {
        FSEventStreamStop(stream);
        FSEventStreamInvalidate(stream);
        FSEventStreamRelease(stream);
        return;
    }

    CFRunLoopRun();

    FSEventStreamStop(stream);
    FSEventStreamInvalidate(stream);
    FSEventStreamRelease(stream);
}

extern "C" fn stream_callback(
    _stream_ref: FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    _event_ids: *const FSEventStreamEventId,
) {
    let mut batch = Vec::with_capacity(num_events);
    let context = unsafe {
        let paths = event_paths as *const *const c_char;
        for i in 0..num_events {
            let path = CStr::from_ptr(*paths.add(i)).to_string_lossy();
            batch.push(RawEvent {
                path: PathBuf::from(path.as_ref()),
                flags: StreamFlags::from_bits_truncate(*event_flags.add(i)),
            });
        }
        &*(info as *const StreamContext)
    };
    process_batch(&context.watcher, &context.tree, batch);
}

/// A CFArray of CFStrings with type callbacks, so the array owns its
/// elements and a single release on the array frees everything.
unsafe fn cf_path_array(paths: &[String]) -> CFArrayRef {
    let strings: Vec<CFStringRef> = paths
        .iter()
        .map(|path| {
            CFStringCreateWithBytes(
                kCFAllocatorDefault,
                path.as_ptr(),
                path.len() as CFIndex,
                kCFStringEncodingUTF8,
                false as u8,
            )
        })
        .collect();
    let array = CFArrayCreate(
        kCFAllocatorDefault,
        strings.as_ptr() as *const *const c_void,
        strings.len() as CFIndex,
        &kCFTypeArrayCallBacks,
    );
    for string in strings {
        CFRelease(string as *const c_void);
    }
    array
}

struct FsSubscription {
    watcher: Arc<Watcher>,
    _stream: FsEventStream,
}

pub(crate) struct FsEventsBackend {
    state: Mutex<Vec<FsSubscription>>,
}

impl FsEventsBackend {
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
        let stream = FsEventStream::spawn(watcher.clone(), tree)?;
        state.push(FsSubscription {
            watcher,
            _stream: stream,
        });
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        let mut state = self.state.lock();
        state.retain(|sub| !Arc::ptr_eq(&sub.watcher, watcher));
        Ok(())
    }
}

/// What one drain decided about one path, before rename pairing.
enum PendingOp {
    Create(DirEntry),
    Update(DirEntry),
    Remove(DirEntry),
}

fn process_batch(watcher: &Arc<Watcher>, dir_tree: &Arc<DirTree>, events: Vec<RawEvent>) {
    let mut ops: Vec<PendingOp> = Vec::new();

    for event in events {
        if event
            .flags
            .intersects(StreamFlags::HISTORY_DONE | StreamFlags::EVENT_IDS_WRAPPED)
        {
            continue;
        }
        if event
            .flags
            .intersects(StreamFlags::ROOT_CHANGED | StreamFlags::MUST_SCAN_SUBDIRS)
        {
            warn!(
                "kernel requested a rescan under {}; events may be incomplete",
                event.path.display()
            );
            continue;
        }
        if watcher.is_ignored(&event.path) || event.path == watcher.root() {
            continue;
        }

        match fs::symlink_metadata(&event.path) {
            Ok(meta) => {
                let is_dir = meta.is_dir();
                let ino = tree::inode_of(&meta);
                let mtime = tree::mtime_nanos(&meta);
                match dir_tree.find(&event.path) {
                    Some(prev) if prev.is_dir == is_dir => {
                        if prev.mtime != mtime || prev.ino != ino {
                            dir_tree.update(&event.path, ino, mtime, "");
                            ops.push(PendingOp::Update(DirEntry::new(
                                event.path.clone(),
                                ino,
                                mtime,
                                is_dir,
                                "",
                            )));
                        } else {
                            debug!("{} unchanged on disk", event.path.display());
                        }
                    }
                    Some(prev) => {
                        dir_tree.remove(&event.path);
                        let entry = dir_tree.add(&event.path, ino, mtime, is_dir, "");
                        ops.push(PendingOp::Remove(prev));
                        ops.push(PendingOp::Create(entry));
                    }
                    None => {
                        let entry = dir_tree.add(&event.path, ino, mtime, is_dir, "");
                        ops.push(PendingOp::Create(entry));
                    }
                }
            }
            Err(_) => {
                if let Some(prev) = dir_tree.find(&event.path) {
                    dir_tree.remove(&event.path);
                    ops.push(PendingOp::Remove(prev));
                }
            }
        }
    }

    emit(watcher, ops);
    watcher.notify();
}

/// Applies the drain to the event log, pairing a removal and an appearance
/// of the same inode into a rename.
fn emit(watcher: &Arc<Watcher>, ops: Vec<PendingOp>) {
    // Match each create against the earliest unconsumed remove of the same
    // inode, regardless of which half of the pair the kernel reported
    // first; everything else is emitted in observed order.
    let mut remove_consumed = vec![false; ops.len()];
    let mut create_source: Vec<Option<usize>> = vec![None; ops.len()];
    for create_index in 0..ops.len() {
        let PendingOp::Create(created) = &ops[create_index] else {
            continue;
        };
        if created.ino == tree::FAKE_INO {
            continue;
        }
        for remove_index in 0..ops.len() {
            if remove_consumed[remove_index] {
                continue;
            }
            let PendingOp::Remove(removed) = &ops[remove_index] else {
                continue;
            };
            if removed.ino == created.ino {
                remove_consumed[remove_index] = true;
                create_source[create_index] = Some(remove_index);
                break;
            }
        }
    }

    let events = watcher.events();
    for (index, op) in ops.iter().enumerate() {
        match op {
            PendingOp::Remove(entry) => {
                if !remove_consumed[index] {
                    events.remove(&entry.path, entry.is_dir, entry.ino, &entry.file_id);
                }
            }
            PendingOp::Update(entry) => {
                events.update(&entry.path, entry.ino, &entry.file_id);
            }
            PendingOp::Create(entry) => match create_source[index] {
                Some(remove_index) => {
                    let PendingOp::Remove(removed) = &ops[remove_index] else {
                        unreachable!("sources only point at removes");
                    };
                    events.rename(&removed.path, &entry.path, entry.is_dir, entry.ino, &entry.file_id);
                }
                None => {
                    events.create(&entry.path, entry.is_dir, entry.ino, &entry.file_id);
                }
            },
        }
    }
}
