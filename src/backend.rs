//! Backend selection and the public watch operations.
//!
//! Each platform gets one native driver plus the portable brute-force
//! fallback; a process-wide registry shares one started backend per kind so
//! every subscription of a kind funnels through the same kernel channel and
//! watch thread. Snapshot mode (`scan`, `write_snapshot`, `events_since`)
//! always runs on the brute-force implementations, which read the
//! filesystem directly instead of the kernel stream.

mod brute_force;

#[cfg(target_os = "linux")]
mod inotify;

#[cfg(target_os = "macos")]
mod fsevents;

#[cfg(windows)]
mod windows;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Result, WatcherError};
use crate::events::Event;
use crate::watcher::Watcher;

/// The available watch drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Inotify,
    FsEvents,
    Windows,
    BruteForce,
}

impl BackendKind {
    /// The best native kind for this platform.
    pub fn native() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Inotify
        }
        #[cfg(target_os = "macos")]
        {
            Self::FsEvents
        }
        #[cfg(windows)]
        {
            Self::Windows
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
        {
            Self::BruteForce
        }
    }

    fn is_supported(self) -> bool {
        match self {
            Self::BruteForce => true,
            Self::Inotify => cfg!(target_os = "linux"),
            Self::FsEvents => cfg!(target_os = "macos"),
            Self::Windows => cfg!(windows),
        }
    }

    /// Maps a request onto something this platform can drive; unsupported
    /// and unspecified requests yield the platform default.
    pub(crate) fn resolve(requested: Option<BackendKind>) -> BackendKind {
        match requested {
            Some(kind) if kind.is_supported() => kind,
            Some(kind) => {
                debug!("backend {kind} unavailable here, using {}", Self::native());
                Self::native()
            }
            None => Self::native(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inotify => "inotify",
            Self::FsEvents => "fs-events",
            Self::Windows => "windows",
            Self::BruteForce => "brute-force",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inotify" => Ok(Self::Inotify),
            "fs-events" => Ok(Self::FsEvents),
            "windows" => Ok(Self::Windows),
            "brute-force" => Ok(Self::BruteForce),
            other => Err(WatcherError::Unsupported(format!(
                "unknown backend \"{other}\""
            ))),
        }
    }
}

/// Options accepted by every public operation.
#[derive(Default)]
pub struct WatchOptions {
    /// Preferred driver; `None` selects the platform default.
    pub backend: Option<BackendKind>,
    /// Absolute paths to suppress, including everything beneath them.
    pub ignore_paths: Vec<PathBuf>,
    /// Glob patterns to suppress, matched against absolute paths.
    pub ignore_globs: Vec<String>,
}

pub(crate) enum Backend {
    BruteForce,
    #[cfg(target_os = "linux")]
    Inotify(inotify::InotifyBackend),
    #[cfg(target_os = "macos")]
    FsEvents(fsevents::FsEventsBackend),
    #[cfg(windows)]
    Windows(windows::WindowsBackend),
}

impl Backend {
    fn start(kind: BackendKind) -> Result<Self> {
        match kind {
            BackendKind::BruteForce => Ok(Self::BruteForce),
            #[cfg(target_os = "linux")]
            BackendKind::Inotify => Ok(Self::Inotify(inotify::InotifyBackend::new()?)),
            #[cfg(target_os = "macos")]
            BackendKind::FsEvents => Ok(Self::FsEvents(fsevents::FsEventsBackend::new()?)),
            #[cfg(windows)]
            BackendKind::Windows => Ok(Self::Windows(windows::WindowsBackend::new()?)),
            other => Err(WatcherError::Unsupported(format!(
                "backend {other} is not available on this platform"
            ))),
        }
    }

    fn subscribe(&self, watcher: Arc<Watcher>) -> Result<()> {
        match self {
            Self::BruteForce => Err(WatcherError::Unsupported(
                "the brute-force backend does not support subscriptions".into(),
            )),
            #[cfg(target_os = "linux")]
            Self::Inotify(backend) => backend.subscribe(watcher),
            #[cfg(target_os = "macos")]
            Self::FsEvents(backend) => backend.subscribe(watcher),
            #[cfg(windows)]
            Self::Windows(backend) => backend.subscribe(watcher),
        }
    }

    fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        match self {
            Self::BruteForce => Ok(()),
            #[cfg(target_os = "linux")]
            Self::Inotify(backend) => backend.unsubscribe(watcher),
            #[cfg(target_os = "macos")]
            Self::FsEvents(backend) => backend.unsubscribe(watcher),
            #[cfg(windows)]
            Self::Windows(backend) => backend.unsubscribe(watcher),
        }
    }
}

/// One started backend per kind, shared by every subscription.
static BACKENDS: LazyLock<Mutex<HashMap<BackendKind, Arc<Backend>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn shared_backend(kind: BackendKind) -> Result<Arc<Backend>> {
    let mut backends = BACKENDS.lock();
    if let Some(backend) = backends.get(&kind) {
        return Ok(backend.clone());
    }
    let backend = Arc::new(Backend::start(kind)?);
    backends.insert(kind, backend.clone());
    Ok(backend)
}

/// Canonicalizes `dir` (resolving symlinks in the root path) and checks it
/// is an existing directory.
fn resolve_root(dir: &Path) -> Result<PathBuf> {
    let root = fs::canonicalize(dir).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            WatcherError::PathNotFound(dir.to_path_buf())
        } else {
            WatcherError::Io(error)
        }
    })?;
    if !root.is_dir() {
        return Err(WatcherError::NotADirectory(root));
    }
    Ok(root)
}

fn transient_watcher(dir: &Path, options: &WatchOptions) -> Result<Watcher> {
    let root = resolve_root(dir)?;
    Watcher::new(
        root,
        &options.ignore_paths,
        &options.ignore_globs,
        Box::new(|_| {}),
    )
}

/// Handle to one active subscription. Dropping it unsubscribes.
pub struct Subscription {
    watcher: Option<Arc<Watcher>>,
    backend: Arc<Backend>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    /// Stops delivery and releases the kernel resources of this
    /// subscription.
    pub fn unsubscribe(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        match self.watcher.take() {
            Some(watcher) => self.backend.unsubscribe(&watcher),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!("unsubscribe on drop failed: {error}");
        }
    }
}

/// Starts streaming coalesced event batches for everything under `dir` to
/// `callback`. A backend failure after this returns is delivered to the
/// same callback as a one-shot `Err` and terminates the subscription.
pub fn subscribe<F>(dir: impl AsRef<Path>, callback: F, options: WatchOptions) -> Result<Subscription>
where
    F: Fn(Result<Vec<Event>>) + Send + Sync + 'static,
{
    let root = resolve_root(dir.as_ref())?;
    let kind = BackendKind::resolve(options.backend);
    let watcher = Arc::new(Watcher::new(
        root,
        &options.ignore_paths,
        &options.ignore_globs,
        Box::new(callback),
    )?);
    let backend = shared_backend(kind)?;
    backend.subscribe(watcher.clone())?;
    Ok(Subscription {
        watcher: Some(watcher),
        backend,
    })
}

/// One-shot scan: a create event per existing entry under `dir`, excluding
/// `dir` itself.
pub fn scan(dir: impl AsRef<Path>, options: &WatchOptions) -> Result<Vec<Event>> {
    let watcher = transient_watcher(dir.as_ref(), options)?;
    brute_force::scan(&watcher)?;
    Ok(watcher.events().take())
}

/// Persists the current tree state of `dir` to `snapshot_path`.
pub fn write_snapshot(
    dir: impl AsRef<Path>,
    snapshot_path: impl AsRef<Path>,
    options: &WatchOptions,
) -> Result<()> {
    let watcher = transient_watcher(dir.as_ref(), options)?;
    brute_force::write_snapshot(&watcher, snapshot_path.as_ref())
}

/// Computes the events that happened to `dir` since `snapshot_path` was
/// written.
pub fn events_since(
    dir: impl AsRef<Path>,
    snapshot_path: impl AsRef<Path>,
    options: &WatchOptions,
) -> Result<Vec<Event>> {
    let watcher = transient_watcher(dir.as_ref(), options)?;
    brute_force::events_since(&watcher, snapshot_path.as_ref())?;
    Ok(watcher.events().take())
}
