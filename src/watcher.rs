//! Per-subscription state: root, ignore set, event log, consumer callback.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Result, WatcherError};
use crate::events::{Event, EventList};

/// Consumer callback: receives event batches, or a one-shot error that
/// terminates the subscription.
pub type EventCallback = Box<dyn Fn(Result<Vec<Event>>) + Send + Sync>;

/// One active subscription (or one transient scan/snapshot operation).
///
/// Several watchers may exist for the same root; each keeps its own ignore
/// set and event log while sharing the interned `DirTree`.
pub struct Watcher {
    root: PathBuf,
    ignore_paths: HashSet<PathBuf>,
    ignore_globs: Vec<glob::Pattern>,
    events: EventList,
    callback: EventCallback,
}

impl Watcher {
    pub(crate) fn new(
        root: PathBuf,
        ignore_paths: &[PathBuf],
        ignore_globs: &[String],
        callback: EventCallback,
    ) -> Result<Self> {
        let mut globs = Vec::with_capacity(ignore_globs.len());
        for pattern in ignore_globs {
            globs.push(glob::Pattern::new(pattern)?);
        }
        Ok(Self {
            root,
            ignore_paths: ignore_paths.iter().cloned().collect(),
            ignore_globs: globs,
            events: EventList::new(),
            callback,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when `path` equals or lies under an ignored path, or matches an
    /// ignore pattern. Ignored paths are filtered before they can touch the
    /// tree or the event log.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self
            .ignore_paths
            .iter()
            .any(|ignored| path == ignored || path.starts_with(ignored))
        {
            return true;
        }
        self.ignore_globs
            .iter()
            .any(|pattern| pattern.matches_path(path))
    }

    /// The ignored roots, for backends that can push exclusions down to
    /// the kernel.
    #[allow(dead_code)]
    pub(crate) fn ignored_roots(&self) -> Vec<PathBuf> {
        self.ignore_paths.iter().cloned().collect()
    }

    pub(crate) fn events(&self) -> &EventList {
        &self.events
    }

    /// Delivers the pending batch to the consumer; quiet wakeups (an empty
    /// log) are skipped.
    pub(crate) fn notify(&self) {
        let batch = self.events.take();
        if !batch.is_empty() {
            (self.callback)(Ok(batch));
        }
    }

    /// Delivers a terminal failure to the consumer.
    pub(crate) fn deliver_error(&self, error: WatcherError) {
        (self.callback)(Err(error));
    }
}
