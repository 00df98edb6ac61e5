//! Linux watch driver on the inotify API.
//!
//! inotify watches are per-directory, so subscribing installs one watch on
//! the root and on every directory below it, and newly appearing
//! directories are watched (and caught up) as they are reported. A single
//! watch descriptor may serve several watchers that share a root; the
//! descriptor-to-subscription multimap resolves the fan-out.
//!
//! Renames arrive as a MOVED_FROM / MOVED_TO pair tied by a cookie. The
//! event log sees them as remove + create; the pairing itself only decides
//! whether a directory kept its descendants' watch descriptors (a move
//! inside the root) and therefore needs its recorded paths rewritten
//! instead of a fresh walk.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use inotify as inotify_sys;
use inotify_sys::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use log::{debug, error, warn};
use mio::unix::SourceFd;
use mio::{Events as MioEvents, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use super::brute_force;
use crate::error::{Result, WatcherError};
use crate::tree::{self, DirTree};
use crate::watcher::Watcher;

const INOTIFY_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Wakeup interval of the watch thread when the kernel is quiet; bounds
/// how long shutdown and pending-move expiry can lag.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Unpaired moved-from records older than this are dropped.
const PENDING_MOVE_TIMEOUT: Duration = Duration::from_secs(5);

fn watch_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DONT_FOLLOW
        | WatchMask::ONLYDIR
        | WatchMask::EXCL_UNLINK
}

enum Control {
    Shutdown,
}

/// One (watched directory, watcher) association under a descriptor.
#[derive(Clone)]
struct Subscription {
    path: PathBuf,
    tree: Arc<DirTree>,
    watcher: Arc<Watcher>,
}

/// The source half of a rename, waiting for its destination.
struct PendingMove {
    at: Instant,
    path: PathBuf,
}

struct State {
    watches: Watches,
    subscriptions: HashMap<WatchDescriptor, Vec<Subscription>>,
    pending_moves: HashMap<u32, PendingMove>,
    dead: bool,
}

/// An inotify event copied out of the read buffer.
struct OwnedEvent {
    wd: WatchDescriptor,
    mask: EventMask,
    cookie: u32,
    name: Option<OsString>,
}

pub(crate) struct InotifyBackend {
    state: Arc<Mutex<State>>,
    waker: Arc<Waker>,
    control_tx: Sender<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InotifyBackend {
    pub(crate) fn new() -> Result<Self> {
        let inotify = Inotify::init()
            .map_err(|error| WatcherError::Watch(format!("inotify init failed: {error}")))?;
        let poll = Poll::new()
            .map_err(|error| WatcherError::Watch(format!("poll init failed: {error}")))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|error| WatcherError::Watch(format!("waker init failed: {error}")))?,
        );
        let fd = inotify.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), INOTIFY_TOKEN, Interest::READABLE)
            .map_err(|error| WatcherError::Watch(format!("poll register failed: {error}")))?;

        let (control_tx, control_rx) = unbounded();
        let state = Arc::new(Mutex::new(State {
            watches: inotify.watches(),
            subscriptions: HashMap::new(),
            pending_moves: HashMap::new(),
            dead: false,
        }));

        let thread_state = state.clone();
        let thread = thread::Builder::new()
            .name("treewatch-inotify".into())
            .spawn(move || run(inotify, poll, thread_state, control_rx))
            .map_err(|error| WatcherError::Watch(format!("watch thread spawn failed: {error}")))?;

        Ok(Self {
            state,
            waker,
            control_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn subscribe(&self, watcher: Arc<Watcher>) -> Result<()> {
        let tree = DirTree::cached(watcher.root(), false);
        if !tree.is_complete() {
            brute_force::read_tree(&tree, &watcher)?;
        }

        let mut state = self.state.lock();
        if state.dead {
            return Err(WatcherError::Watch(
                "inotify watch thread has terminated".into(),
            ));
        }
        if let Err(error) = install_watches(&mut state, &tree, &watcher) {
            remove_watcher(&mut state, &watcher);
            return Err(error);
        }
        debug!(
            "subscribed {} ({} directories watched)",
            watcher.root().display(),
            state.subscriptions.len()
        );
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        let mut state = self.state.lock();
        remove_watcher(&mut state, watcher);
        debug!("unsubscribed {}", watcher.root().display());
        Ok(())
    }
}

impl Drop for InotifyBackend {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn install_watches(state: &mut State, tree: &Arc<DirTree>, watcher: &Arc<Watcher>) -> Result<()> {
    add_dir_watch(state, watcher.root(), tree, watcher)?;
    for entry in tree.entries() {
        if entry.is_dir && !watcher.is_ignored(&entry.path) {
            add_dir_watch(state, &entry.path, tree, watcher)?;
        }
    }
    Ok(())
}

fn add_dir_watch(
    state: &mut State,
    path: &Path,
    tree: &Arc<DirTree>,
    watcher: &Arc<Watcher>,
) -> Result<()> {
    let wd = state.watches.add(path, watch_mask()).map_err(|error| {
        WatcherError::Watch(format!("failed to watch {}: {error}", path.display()))
    })?;
    let subs = state.subscriptions.entry(wd).or_default();
    if !subs
        .iter()
        .any(|sub| sub.path == path && Arc::ptr_eq(&sub.watcher, watcher))
    {
        subs.push(Subscription {
            path: path.to_path_buf(),
            tree: tree.clone(),
            watcher: watcher.clone(),
        });
    }
    Ok(())
}

fn remove_watcher(state: &mut State, watcher: &Arc<Watcher>) {
    let mut emptied: Vec<WatchDescriptor> = Vec::new();
    for (wd, subs) in state.subscriptions.iter_mut() {
        subs.retain(|sub| !Arc::ptr_eq(&sub.watcher, watcher));
        if subs.is_empty() {
            emptied.push(wd.clone());
        }
    }
    for wd in emptied {
        state.subscriptions.remove(&wd);
        // The kernel may already have dropped the watch with the directory.
        let _ = state.watches.remove(wd);
    }
}

/// Erases every subscription record for a directory that vanished.
fn remove_subscriptions_at(state: &mut State, path: &Path) {
    let mut emptied: Vec<WatchDescriptor> = Vec::new();
    for (wd, subs) in state.subscriptions.iter_mut() {
        subs.retain(|sub| sub.path != path);
        if subs.is_empty() {
            emptied.push(wd.clone());
        }
    }
    for wd in emptied {
        state.subscriptions.remove(&wd);
        let _ = state.watches.remove(wd);
    }
}

fn run(mut inotify: Inotify, mut poll: Poll, state: Arc<Mutex<State>>, control_rx: Receiver<Control>) {
    let mut mio_events = MioEvents::with_capacity(16);
    let mut buffer = [0u8; 65536];

    loop {
        if let Err(error) = poll.poll(&mut mio_events, Some(POLL_TIMEOUT)) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            fail(&state, &format!("poll failed: {error}"));
            return;
        }
        if matches!(control_rx.try_recv(), Ok(Control::Shutdown)) {
            return;
        }

        expire_pending_moves(&state);

        let mut touched: Vec<Arc<Watcher>> = Vec::new();
        loop {
            let drained: Vec<OwnedEvent> = match inotify.read_events(&mut buffer) {
                Ok(events) => events
                    .map(|event| OwnedEvent {
                        wd: event.wd,
                        mask: event.mask,
                        cookie: event.cookie,
                        name: event.name.map(|name| name.to_os_string()),
                    })
                    .collect(),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    fail(&state, &format!("inotify read failed: {error}"));
                    return;
                }
            };
            if drained.is_empty() {
                break;
            }
            let mut state_guard = state.lock();
            for event in drained {
                handle_event(&mut state_guard, event, &mut touched);
            }
        }

        // One callback per touched watcher per drain, outside the lock.
        for watcher in dedup_watchers(touched) {
            watcher.notify();
        }
    }
}

fn handle_event(state: &mut State, event: OwnedEvent, touched: &mut Vec<Arc<Watcher>>) {
    if event.mask.contains(EventMask::Q_OVERFLOW) {
        warn!("inotify queue overflowed; events were dropped");
        return;
    }
    if event.mask.contains(EventMask::IGNORED) {
        state.subscriptions.remove(&event.wd);
        return;
    }

    let Some(subs) = state.subscriptions.get(&event.wd).cloned() else {
        return;
    };

    // Resolve a rename pair once per event; each subscription then applies
    // the (idempotent) rewrite to its own tree.
    let pending = if event.mask.contains(EventMask::MOVED_TO) {
        state.pending_moves.remove(&event.cookie)
    } else {
        None
    };

    for sub in &subs {
        let path = match &event.name {
            Some(name) => sub.path.join(name),
            None => sub.path.clone(),
        };
        // A descriptor follows its inode; a directory moved outside this
        // watcher's root keeps firing until its record ages out.
        if !path.starts_with(sub.watcher.root()) {
            continue;
        }
        if sub.watcher.is_ignored(&path) {
            continue;
        }

        if event
            .mask
            .intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF)
        {
            handle_self_gone(state, sub, &path);
        } else if event
            .mask
            .intersects(EventMask::CREATE | EventMask::MOVED_TO)
        {
            handle_created(state, sub, &path, pending.as_ref());
        } else if event.mask.contains(EventMask::MOVED_FROM) {
            handle_moved_from(
                state,
                sub,
                &path,
                event.cookie,
                event.mask.contains(EventMask::ISDIR),
            );
        } else if event.mask.contains(EventMask::DELETE) {
            handle_deleted(state, sub, &path, event.mask.contains(EventMask::ISDIR));
        } else if event.mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
            handle_modified(sub, &path);
        } else {
            debug!(
                "unhandled inotify mask {:?} for {}",
                event.mask,
                path.display()
            );
            continue;
        }
        touched.push(sub.watcher.clone());
    }
}

fn handle_created(
    state: &mut State,
    sub: &Subscription,
    path: &Path,
    pending: Option<&PendingMove>,
) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        // Gone again already; the matching delete will follow.
        return;
    };
    let is_dir = meta.is_dir();
    let ino = tree::inode_of(&meta);
    sub.tree
        .add(path, ino, tree::mtime_nanos(&meta), is_dir, "");
    sub.watcher.events().create(path, is_dir, ino, "");

    if !is_dir {
        return;
    }
    match pending {
        Some(mv) => {
            // A directory moved inside the root keeps its descendants'
            // watch descriptors; only the recorded paths are stale.
            rewrite_subscription_paths(state, &mv.path, path);
            sub.tree.rewrite_prefix(&mv.path, path);
        }
        None => {
            // Contents may have appeared before the watch did.
            if let Err(error) = register_new_directory(state, sub, path) {
                error!("failed to watch {}: {error}", path.display());
                sub.watcher.deliver_error(error);
                remove_watcher(state, &sub.watcher);
            }
        }
    }
}

/// Installs a watch on a directory that appeared mid-stream and catches up
/// on its contents.
fn register_new_directory(state: &mut State, sub: &Subscription, dir: &Path) -> Result<()> {
    add_dir_watch(state, dir, &sub.tree, &sub.watcher)?;

    let Ok(reader) = fs::read_dir(dir) else {
        return Ok(());
    };
    let mut children: Vec<PathBuf> = reader
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    children.sort();

    for child in children {
        if sub.watcher.is_ignored(&child) {
            continue;
        }
        let Ok(meta) = fs::symlink_metadata(&child) else {
            continue;
        };
        let is_dir = meta.is_dir();
        let ino = tree::inode_of(&meta);
        sub.tree
            .add(&child, ino, tree::mtime_nanos(&meta), is_dir, "");
        sub.watcher.events().create(&child, is_dir, ino, "");
        if is_dir {
            register_new_directory(state, sub, &child)?;
        }
    }
    Ok(())
}

fn handle_moved_from(
    state: &mut State,
    sub: &Subscription,
    path: &Path,
    cookie: u32,
    is_dir_mask: bool,
) {
    state.pending_moves.insert(
        cookie,
        PendingMove {
            at: Instant::now(),
            path: path.to_path_buf(),
        },
    );
    let entry = sub.tree.find(path);
    let is_dir = entry.as_ref().map(|e| e.is_dir).unwrap_or(is_dir_mask);
    let (ino, file_id) = entry
        .map(|e| (e.ino, e.file_id))
        .unwrap_or((tree::FAKE_INO, String::new()));
    sub.tree.remove(path);
    sub.watcher.events().remove(path, is_dir, ino, &file_id);
}

fn handle_deleted(state: &mut State, sub: &Subscription, path: &Path, is_dir_mask: bool) {
    let entry = sub.tree.find(path);
    let is_dir = entry.as_ref().map(|e| e.is_dir).unwrap_or(is_dir_mask);
    let (ino, file_id) = entry
        .map(|e| (e.ino, e.file_id))
        .unwrap_or((tree::FAKE_INO, String::new()));
    sub.tree.remove(path);
    sub.watcher.events().remove(path, is_dir, ino, &file_id);
    if is_dir {
        remove_subscriptions_at(state, path);
    }
}

/// A watched directory itself vanished. Only the subscription root is worth
/// reporting; for any other directory the parent's watch already produced
/// the delete.
fn handle_self_gone(state: &mut State, sub: &Subscription, path: &Path) {
    if path == sub.watcher.root() {
        sub.watcher
            .events()
            .remove(path, true, tree::FAKE_INO, "");
    }
    sub.tree.remove(path);
    remove_subscriptions_at(state, path);
}

fn handle_modified(sub: &Subscription, path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    let ino = tree::inode_of(&meta);
    sub.tree
        .update(path, ino, tree::mtime_nanos(&meta), "");
    sub.watcher.events().update(path, ino, "");
}

/// Re-keys every subscription under a moved directory.
fn rewrite_subscription_paths(state: &mut State, old_prefix: &Path, new_prefix: &Path) {
    for subs in state.subscriptions.values_mut() {
        for sub in subs.iter_mut() {
            if sub.path == old_prefix || sub.path.starts_with(old_prefix) {
                let suffix = sub
                    .path
                    .strip_prefix(old_prefix)
                    .expect("checked prefix")
                    .to_path_buf();
                sub.path = new_prefix.join(suffix);
            }
        }
    }
}

fn expire_pending_moves(state: &Arc<Mutex<State>>) {
    let mut state = state.lock();
    let now = Instant::now();
    state.pending_moves.retain(|cookie, mv| {
        let keep = now.duration_since(mv.at) <= PENDING_MOVE_TIMEOUT;
        if !keep {
            debug!(
                "expiring unpaired move of {} (cookie {cookie})",
                mv.path.display()
            );
        }
        keep
    });
}

/// Terminal failure: every subscribed watcher hears about it once, then the
/// watch thread exits.
fn fail(state: &Arc<Mutex<State>>, message: &str) {
    error!("inotify watch thread terminating: {message}");
    let watchers = {
        let mut state = state.lock();
        state.dead = true;
        let mut watchers: Vec<Arc<Watcher>> = Vec::new();
        for subs in state.subscriptions.values() {
            for sub in subs {
                if !watchers.iter().any(|w| Arc::ptr_eq(w, &sub.watcher)) {
                    watchers.push(sub.watcher.clone());
                }
            }
        }
        state.subscriptions.clear();
        watchers
    };
    for watcher in watchers {
        watcher.deliver_error(WatcherError::Watch(message.to_string()));
    }
}

fn dedup_watchers(watchers: Vec<Arc<Watcher>>) -> Vec<Arc<Watcher>> {
    let mut unique: Vec<Arc<Watcher>> = Vec::new();
    for watcher in watchers {
        if !unique.iter().any(|seen| Arc::ptr_eq(seen, &watcher)) {
            unique.push(watcher);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use crate::backend::{subscribe, WatchOptions};
    use crate::events::{Event, EventType};
    use crate::Result;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn subscription(
        root: &std::path::Path,
        options: WatchOptions,
    ) -> (crate::Subscription, Receiver<Result<Vec<Event>>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx): (Sender<Result<Vec<Event>>>, _) = unbounded();
        let sub = subscribe(root, move |batch| drop(tx.send(batch)), options).unwrap();
        // Give the watch thread a beat before mutating the filesystem.
        std::thread::sleep(Duration::from_millis(100));
        (sub, rx)
    }

    fn collect(rx: &Receiver<Result<Vec<Event>>>, window: Duration) -> Vec<Event> {
        let deadline = Instant::now() + window;
        let mut all = Vec::new();
        while let Ok(batch) = rx.recv_deadline(deadline) {
            if let Ok(events) = batch {
                all.extend(events);
            }
        }
        all
    }

    fn has(events: &[Event], event_type: EventType, path: &PathBuf) -> bool {
        events
            .iter()
            .any(|e| e.event_type() == event_type && e.path == *path)
    }

    #[test]
    fn reports_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let (sub, rx) = subscription(&root, WatchOptions::default());

        let target = root.join("a.txt");
        fs::write(&target, b"hello").unwrap();

        let events = collect(&rx, Duration::from_millis(1500));
        assert!(has(&events, EventType::Create, &target), "{events:?}");
        sub.unsubscribe().unwrap();
    }

    #[test]
    fn reports_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let target = root.join("doomed.txt");
        fs::write(&target, b"x").unwrap();

        let (sub, rx) = subscription(&root, WatchOptions::default());
        fs::remove_file(&target).unwrap();

        let events = collect(&rx, Duration::from_millis(1500));
        assert!(has(&events, EventType::Delete, &target), "{events:?}");
        sub.unsubscribe().unwrap();
    }

    #[test]
    fn reports_renames_as_remove_and_create() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let from = root.join("a.txt");
        let to = root.join("b.txt");
        fs::write(&from, b"x").unwrap();

        let (sub, rx) = subscription(&root, WatchOptions::default());
        fs::rename(&from, &to).unwrap();

        let events = collect(&rx, Duration::from_millis(1500));
        assert!(has(&events, EventType::Delete, &from), "{events:?}");
        assert!(has(&events, EventType::Create, &to), "{events:?}");
        sub.unsubscribe().unwrap();
    }

    #[test]
    fn moved_directory_keeps_delivering_under_new_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let old_dir = root.join("old");
        let new_dir = root.join("new");
        fs::create_dir(&old_dir).unwrap();
        fs::write(old_dir.join("seed.txt"), b"x").unwrap();

        let (sub, rx) = subscription(&root, WatchOptions::default());
        fs::rename(&old_dir, &new_dir).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let late = new_dir.join("late.txt");
        fs::write(&late, b"y").unwrap();

        let events = collect(&rx, Duration::from_millis(1500));
        assert!(has(&events, EventType::Delete, &old_dir), "{events:?}");
        assert!(has(&events, EventType::Create, &new_dir), "{events:?}");
        assert!(
            has(&events, EventType::Create, &late),
            "watch followed the moved directory: {events:?}"
        );
        sub.unsubscribe().unwrap();
    }

    #[test]
    fn ignored_paths_never_surface() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let options = WatchOptions {
            ignore_paths: vec![root.join("ignored")],
            ..WatchOptions::default()
        };
        let (sub, rx) = subscription(&root, options);

        fs::write(root.join("ignored"), b"x").unwrap();
        fs::write(root.join("seen.txt"), b"y").unwrap();

        let events = collect(&rx, Duration::from_millis(1500));
        assert!(has(&events, EventType::Create, &root.join("seen.txt")));
        assert!(
            !events.iter().any(|e| e.path == root.join("ignored")),
            "{events:?}"
        );
        sub.unsubscribe().unwrap();
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let (sub, rx) = subscription(&root, WatchOptions::default());
        sub.unsubscribe().unwrap();

        fs::write(root.join("after.txt"), b"x").unwrap();
        let events = collect(&rx, Duration::from_millis(700));
        assert!(events.is_empty(), "{events:?}");
    }

    #[test]
    fn subscribing_a_missing_root_fails() {
        let err = subscribe(
            std::path::Path::new("/definitely/not/here"),
            |_| {},
            WatchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::WatcherError::PathNotFound(_)), "{err}");
    }
}
