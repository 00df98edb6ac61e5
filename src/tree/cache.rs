//! Process-wide interning of trees by root path.
//!
//! Watchers hold strong references; the cache holds weak ones, so a tree
//! lives exactly as long as its last subscription and the cache never keeps
//! a root alive on its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use super::dir_tree::DirTree;

static TREE_CACHE: LazyLock<Mutex<HashMap<PathBuf, Weak<DirTree>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl DirTree {
    /// Returns the live tree for `root`, or constructs an empty one.
    ///
    /// `recursive_remove` only applies when this call constructs the tree;
    /// a cache hit returns the existing instance with its original policy.
    pub fn cached(root: &Path, recursive_remove: bool) -> Arc<DirTree> {
        let mut cache = TREE_CACHE.lock();
        if let Some(weak) = cache.get(root) {
            if let Some(tree) = weak.upgrade() {
                return tree;
            }
        }
        let tree = Arc::new(DirTree::new(root.to_path_buf(), recursive_remove));
        cache.insert(root.to_path_buf(), Arc::downgrade(&tree));
        tree
    }
}

impl Drop for DirTree {
    fn drop(&mut self) {
        // Clear this root's slot unless a newer tree already claimed it.
        let mut cache = TREE_CACHE.lock();
        if let Some(weak) = cache.get(self.root()) {
            if weak.strong_count() == 0 {
                cache.remove(self.root());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_root_shares_one_tree() {
        let dir = tempfile::tempdir().unwrap();
        let a = DirTree::cached(dir.path(), false);
        let b = DirTree::cached(dir.path(), true);
        assert!(Arc::ptr_eq(&a, &b));
        a.add(&dir.path().join("x"), 1, 0, false, "");
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn dropping_last_reference_clears_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let tree = DirTree::cached(dir.path(), false);
        tree.add(Path::new("x"), 1, 0, false, "");
        tree.set_complete();
        drop(tree);

        let fresh = DirTree::cached(dir.path(), false);
        assert!(!fresh.is_complete(), "slot was rebuilt, not resurrected");
        assert!(fresh.is_empty());
    }
}
