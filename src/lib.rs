//! Recursive filesystem change notification with coalesced events and
//! snapshot diffing.
//!
//! Given a root directory, this crate reports the sequence of logical
//! events (create, update, delete, rename) affecting anything beneath it,
//! identifying each object by path, kind, and a stable inode-style
//! identity. Two modes are available:
//!
//! - **Subscription**: [`subscribe`] streams coalesced event batches to a
//!   callback, driven by the platform's native notification API (inotify,
//!   FSEvents, or `ReadDirectoryChangesW`).
//! - **Snapshot**: [`write_snapshot`] persists the tree state to disk and
//!   [`events_since`] later computes the events that reconcile that
//!   snapshot with the current filesystem, no subscription required.
//!
//! ```no_run
//! use treewatch::{subscribe, WatchOptions};
//!
//! let subscription = subscribe(
//!     "/some/root",
//!     |batch| match batch {
//!         Ok(events) => {
//!             for event in events {
//!                 println!("{} {}", event.event_type().as_str(), event.path.display());
//!             }
//!         }
//!         Err(error) => eprintln!("watch lost: {error}"),
//!     },
//!     WatchOptions::default(),
//! )?;
//! // ...
//! subscription.unsubscribe()?;
//! # Ok::<(), treewatch::WatcherError>(())
//! ```

mod backend;
mod error;
mod events;
pub mod snapshot;
mod tree;
mod watcher;

pub use backend::{
    events_since, scan, subscribe, write_snapshot, BackendKind, Subscription, WatchOptions,
};
pub use error::{Result, WatcherError};
pub use events::{Event, EventList, EventType};
pub use tree::{DirEntry, DirTree, FAKE_FILE_ID, FAKE_INO};
pub use watcher::{EventCallback, Watcher};
