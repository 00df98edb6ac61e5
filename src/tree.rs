//! The in-memory model of a watched subtree.
//!
//! A `DirTree` caches one entry per filesystem object under a root. Backends
//! keep it current from kernel notifications, snapshot mode serializes it to
//! disk, and `DirTree::get_changes` reconstructs logical events from two
//! tree states. Trees are interned process-wide by root path so concurrent
//! subscriptions to the same root share one instance.

mod cache;
mod dir_tree;
mod entry;

pub use dir_tree::DirTree;
pub use entry::{DirEntry, FAKE_FILE_ID, FAKE_INO};

pub(crate) use entry::{inode_of, mtime_nanos};
