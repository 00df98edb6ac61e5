//! Path-keyed entry cache for one watched root, plus the snapshot diff.

use std::fmt;
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use super::entry::{DirEntry, FAKE_INO};
use crate::events::EventList;

/// The entry cache of one root directory.
///
/// Every stored path lies strictly below `root` (the root itself is not an
/// entry). All mutation and any iteration that could race with mutation go
/// through the interior mutex.
pub struct DirTree {
    root: PathBuf,
    recursive_remove: bool,
    state: Mutex<TreeState>,
}

impl fmt::Debug for DirTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirTree").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TreeState {
    entries: FnvHashMap<PathBuf, DirEntry>,
    is_complete: bool,
}

impl DirTree {
    /// An empty, incomplete tree. `recursive_remove` decides whether
    /// removing a directory entry also purges its descendants; backends
    /// that receive a kernel notification per deleted child pass `false`
    /// and remove entries one by one.
    pub fn new(root: PathBuf, recursive_remove: bool) -> Self {
        Self {
            root,
            recursive_remove,
            state: Mutex::new(TreeState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// False until a full scan has populated the tree.
    pub fn is_complete(&self) -> bool {
        self.state.lock().is_complete
    }

    pub fn set_complete(&self) {
        self.state.lock().is_complete = true;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Inserts or replaces the entry at `path` and returns the stored copy.
    pub fn add(&self, path: &Path, ino: u64, mtime: u64, is_dir: bool, file_id: &str) -> DirEntry {
        let entry = DirEntry::new(path.to_path_buf(), ino, mtime, is_dir, file_id);
        let mut state = self.state.lock();
        state.entries.insert(path.to_path_buf(), entry.clone());
        entry
    }

    /// Updates the entry at `path` in place: `mtime` unconditionally,
    /// identity fields only when the provided values are not sentinels.
    /// Returns the updated entry, or `None` when the path is unknown.
    pub fn update(&self, path: &Path, ino: u64, mtime: u64, file_id: &str) -> Option<DirEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(path)?;
        entry.mtime = mtime;
        if ino != FAKE_INO {
            entry.ino = ino;
        }
        if !file_id.is_empty() {
            entry.file_id = file_id.to_string();
        }
        Some(entry.clone())
    }

    /// Erases the entry at `path`. When the erased entry is a directory and
    /// the tree was built with `recursive_remove`, every descendant entry
    /// is erased with it.
    pub fn remove(&self, path: &Path) {
        let mut state = self.state.lock();
        let removed = state.entries.remove(path);
        if self.recursive_remove && matches!(removed, Some(ref entry) if entry.is_dir) {
            state.entries.retain(|entry_path, _| !entry_path.starts_with(path));
        }
    }

    pub fn find(&self, path: &Path) -> Option<DirEntry> {
        self.state.lock().entries.get(path).cloned()
    }

    pub fn find_by_ino(&self, ino: u64) -> Option<DirEntry> {
        if ino == FAKE_INO {
            return None;
        }
        let state = self.state.lock();
        state.entries.values().find(|e| e.ino == ino).cloned()
    }

    pub fn find_by_file_id(&self, file_id: &str) -> Option<DirEntry> {
        if file_id.is_empty() {
            return None;
        }
        let state = self.state.lock();
        state.entries.values().find(|e| e.file_id == file_id).cloned()
    }

    /// All entries, sorted by path so parents precede children.
    pub fn entries(&self) -> Vec<DirEntry> {
        let state = self.state.lock();
        let mut entries: Vec<DirEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Re-keys every entry below `old_prefix` under `new_prefix`, keeping
    /// identities and mtimes. The entry at `old_prefix` itself is left to
    /// the caller. Used when a watched directory moves inside the root.
    pub fn rewrite_prefix(&self, old_prefix: &Path, new_prefix: &Path) {
        let mut state = self.state.lock();
        let affected: Vec<PathBuf> = state
            .entries
            .keys()
            .filter(|p| p.starts_with(old_prefix) && p.as_path() != old_prefix)
            .cloned()
            .collect();
        for old_path in affected {
            if let Some(mut entry) = state.entries.remove(&old_path) {
                let suffix = old_path
                    .strip_prefix(old_prefix)
                    .expect("filtered on prefix");
                let new_path = new_prefix.join(suffix);
                entry.path = new_path.clone();
                state.entries.insert(new_path, entry);
            }
        }
    }

    /// Computes the events that would turn `prior` into `self`.
    ///
    /// Entries are matched by identity first (file id, then inode), falling
    /// back to the path. An identity match at a different path becomes a
    /// rename (with a synthetic create of the old path so the rename finds
    /// its source in the log); when the moved entry is a directory, the
    /// prior tree's descendants are re-keyed under the new prefix so they
    /// reconcile against their new paths instead of re-emitting. Prior
    /// entries nothing matched are reported as removed, children first.
    ///
    /// Locks `self`, then `prior`; every caller diffs in that order.
    pub fn get_changes(&self, prior: &DirTree, events: &EventList) {
        let current = self.state.lock();
        let prior_state = prior.state.lock();

        let mut remaining = prior_state.entries.clone();
        let mut by_file_id: FnvHashMap<String, PathBuf> = FnvHashMap::default();
        let mut by_ino: FnvHashMap<u64, PathBuf> = FnvHashMap::default();
        for entry in remaining.values() {
            if !entry.file_id.is_empty() {
                by_file_id.insert(entry.file_id.clone(), entry.path.clone());
            }
            if entry.ino != FAKE_INO {
                by_ino.insert(entry.ino, entry.path.clone());
            }
        }

        // Sorted traversal visits a moved directory before its children,
        // so the prefix rewrite lands before the children reconcile.
        let mut current_entries: Vec<&DirEntry> = current.entries.values().collect();
        current_entries.sort_by(|a, b| a.path.cmp(&b.path));

        for entry in current_entries {
            let candidate = if !entry.file_id.is_empty() {
                by_file_id.get(&entry.file_id).cloned()
            } else if entry.ino != FAKE_INO {
                by_ino.get(&entry.ino).cloned()
            } else {
                None
            };

            if let Some(found) = candidate.and_then(|p| remaining.get(&p).cloned()) {
                consume(&mut remaining, &mut by_file_id, &mut by_ino, &found);
                if found.is_dir != entry.is_dir {
                    events.remove(&found.path, found.is_dir, found.ino, &found.file_id);
                    events.create(&entry.path, entry.is_dir, entry.ino, &entry.file_id);
                } else if found.path != entry.path {
                    // The rename coalescer consumes an event at the source
                    // path; synthesize one for it.
                    events.create(&found.path, found.is_dir, entry.ino, &entry.file_id);
                    events.rename(&found.path, &entry.path, entry.is_dir, entry.ino, &entry.file_id);
                    if found.is_dir {
                        rewrite_remaining(
                            &mut remaining,
                            &mut by_file_id,
                            &mut by_ino,
                            &found.path,
                            &entry.path,
                        );
                    }
                } else if !entry.is_dir && found.mtime != entry.mtime {
                    events.update(&entry.path, entry.ino, &entry.file_id);
                }
                continue;
            }

            match remaining.get(&entry.path).cloned() {
                None => events.create(&entry.path, entry.is_dir, entry.ino, &entry.file_id),
                Some(found) => {
                    consume(&mut remaining, &mut by_file_id, &mut by_ino, &found);
                    if !found.is_dir && !entry.is_dir && found.mtime != entry.mtime {
                        events.update(&entry.path, entry.ino, &entry.file_id);
                    }
                }
            }
        }

        // Children before parents, mirroring how deletions unwind.
        let mut leftover: Vec<&DirEntry> = remaining.values().collect();
        leftover.sort_by(|a, b| b.path.cmp(&a.path));
        for entry in leftover {
            events.remove(&entry.path, entry.is_dir, entry.ino, &entry.file_id);
        }
    }
}

fn consume(
    remaining: &mut FnvHashMap<PathBuf, DirEntry>,
    by_file_id: &mut FnvHashMap<String, PathBuf>,
    by_ino: &mut FnvHashMap<u64, PathBuf>,
    found: &DirEntry,
) {
    remaining.remove(&found.path);
    if !found.file_id.is_empty() && by_file_id.get(&found.file_id) == Some(&found.path) {
        by_file_id.remove(&found.file_id);
    }
    if found.ino != FAKE_INO && by_ino.get(&found.ino) == Some(&found.path) {
        by_ino.remove(&found.ino);
    }
}

fn rewrite_remaining(
    remaining: &mut FnvHashMap<PathBuf, DirEntry>,
    by_file_id: &mut FnvHashMap<String, PathBuf>,
    by_ino: &mut FnvHashMap<u64, PathBuf>,
    old_prefix: &Path,
    new_prefix: &Path,
) {
    let affected: Vec<PathBuf> = remaining
        .keys()
        .filter(|p| p.starts_with(old_prefix) && p.as_path() != old_prefix)
        .cloned()
        .collect();
    for old_path in affected {
        if let Some(mut entry) = remaining.remove(&old_path) {
            let suffix = old_path.strip_prefix(old_prefix).expect("filtered on prefix");
            let new_path = new_prefix.join(suffix);
            if !entry.file_id.is_empty() {
                by_file_id.insert(entry.file_id.clone(), new_path.clone());
            }
            if entry.ino != FAKE_INO {
                by_ino.insert(entry.ino, new_path.clone());
            }
            entry.path = new_path.clone();
            remaining.insert(new_path, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    fn tree(root: &str, recursive: bool) -> DirTree {
        DirTree::new(PathBuf::from(root), recursive)
    }

    #[test]
    fn add_replaces_existing_entry() {
        let t = tree("/r", false);
        t.add(Path::new("/r/a"), 1, 10, false, "");
        t.add(Path::new("/r/a"), 2, 20, false, "");
        let entry = t.find(Path::new("/r/a")).unwrap();
        assert_eq!(entry.ino, 2);
        assert_eq!(entry.mtime, 20);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn update_keeps_identity_on_sentinels() {
        let t = tree("/r", false);
        t.add(Path::new("/r/a"), 7, 10, false, "idA");
        let entry = t.update(Path::new("/r/a"), 0, 30, "").unwrap();
        assert_eq!(entry.mtime, 30);
        assert_eq!(entry.ino, 7);
        assert_eq!(entry.file_id, "idA");

        let entry = t.update(Path::new("/r/a"), 9, 40, "idB").unwrap();
        assert_eq!(entry.ino, 9);
        assert_eq!(entry.file_id, "idB");

        assert!(t.update(Path::new("/r/missing"), 1, 1, "").is_none());
    }

    #[test]
    fn recursive_remove_purges_descendants() {
        let t = tree("/r", true);
        t.add(Path::new("/r/d"), 1, 0, true, "");
        t.add(Path::new("/r/d/x"), 2, 0, false, "");
        t.add(Path::new("/r/d/sub"), 3, 0, true, "");
        t.add(Path::new("/r/d/sub/y"), 4, 0, false, "");
        t.add(Path::new("/r/other"), 5, 0, false, "");
        t.remove(Path::new("/r/d"));
        assert_eq!(t.len(), 1);
        assert!(t.find(Path::new("/r/other")).is_some());
    }

    #[test]
    fn non_recursive_remove_leaves_descendants() {
        let t = tree("/r", false);
        t.add(Path::new("/r/d"), 1, 0, true, "");
        t.add(Path::new("/r/d/x"), 2, 0, false, "");
        t.remove(Path::new("/r/d"));
        assert_eq!(t.len(), 1);
        assert!(t.find(Path::new("/r/d/x")).is_some());
    }

    #[test]
    fn prefix_rewrite_moves_descendants() {
        let t = tree("/r", false);
        t.add(Path::new("/r/d"), 1, 0, true, "");
        t.add(Path::new("/r/d/x"), 2, 0, false, "");
        t.add(Path::new("/r/d/sub/y"), 3, 0, false, "");
        t.rewrite_prefix(Path::new("/r/d"), Path::new("/r/e"));
        assert!(t.find(Path::new("/r/d")).is_some(), "prefix entry untouched");
        let moved = t.find(Path::new("/r/e/x")).unwrap();
        assert_eq!(moved.ino, 2);
        assert_eq!(moved.path, PathBuf::from("/r/e/x"));
        assert!(t.find(Path::new("/r/e/sub/y")).is_some());
        assert!(t.find(Path::new("/r/d/x")).is_none());
    }

    #[test]
    fn identity_lookups() {
        let t = tree("/r", false);
        t.add(Path::new("/r/a"), 7, 0, false, "idA");
        assert_eq!(t.find_by_ino(7).unwrap().path, PathBuf::from("/r/a"));
        assert_eq!(t.find_by_file_id("idA").unwrap().ino, 7);
        assert!(t.find_by_ino(0).is_none(), "sentinel never matches");
        assert!(t.find_by_file_id("").is_none());
    }

    fn diff(current: &DirTree, prior: &DirTree) -> Vec<crate::events::Event> {
        let events = EventList::new();
        current.get_changes(prior, &events);
        events.take()
    }

    #[test]
    fn diff_of_identical_trees_is_empty() {
        let prior = tree("/r", false);
        let current = tree("/r", false);
        for t in [&prior, &current] {
            t.add(Path::new("/r/a"), 1, 10, false, "");
            t.add(Path::new("/r/d"), 2, 20, true, "");
        }
        assert!(diff(&current, &prior).is_empty());
    }

    #[test]
    fn diff_detects_create_update_remove() {
        let prior = tree("/r", false);
        prior.add(Path::new("/r/kept"), 1, 10, false, "");
        prior.add(Path::new("/r/gone"), 2, 10, false, "");
        let current = tree("/r", false);
        current.add(Path::new("/r/kept"), 1, 99, false, "");
        current.add(Path::new("/r/new"), 3, 10, false, "");

        let batch = diff(&current, &prior);
        let mut kinds: Vec<(EventType, PathBuf)> = batch
            .into_iter()
            .map(|e| (e.event_type(), e.path))
            .collect();
        kinds.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            kinds,
            vec![
                (EventType::Delete, "/r/gone".into()),
                (EventType::Update, "/r/kept".into()),
                (EventType::Create, "/r/new".into()),
            ]
        );
    }

    #[test]
    fn diff_directory_mtime_change_is_silent() {
        let prior = tree("/r", false);
        prior.add(Path::new("/r/d"), 1, 10, true, "");
        let current = tree("/r", false);
        current.add(Path::new("/r/d"), 1, 99, true, "");
        assert!(diff(&current, &prior).is_empty());
    }

    #[test]
    fn diff_same_inode_different_path_is_rename() {
        let prior = tree("/r", false);
        prior.add(Path::new("/r/a"), 7, 10, false, "");
        let current = tree("/r", false);
        current.add(Path::new("/r/b"), 7, 10, false, "");

        let batch = diff(&current, &prior);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Rename);
        assert_eq!(batch[0].path, PathBuf::from("/r/b"));
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/r/a")));
        assert_eq!(batch[0].ino, 7);
    }

    #[test]
    fn diff_directory_rename_absorbs_children() {
        let prior = tree("/r", false);
        prior.add(Path::new("/r/d"), 5, 10, true, "");
        prior.add(Path::new("/r/d/x"), 6, 10, false, "");
        prior.add(Path::new("/r/d/sub"), 7, 10, true, "");
        prior.add(Path::new("/r/d/sub/y"), 8, 10, false, "");
        let current = tree("/r", false);
        current.add(Path::new("/r/e"), 5, 10, true, "");
        current.add(Path::new("/r/e/x"), 6, 10, false, "");
        current.add(Path::new("/r/e/sub"), 7, 10, true, "");
        current.add(Path::new("/r/e/sub/y"), 8, 10, false, "");

        let batch = diff(&current, &prior);
        assert_eq!(batch.len(), 1, "children reconcile silently: {batch:?}");
        assert_eq!(batch[0].event_type(), EventType::Rename);
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/r/d")));
        assert_eq!(batch[0].path, PathBuf::from("/r/e"));
    }

    #[test]
    fn diff_kind_flip_collapses_to_update_at_same_path() {
        // remove(old kind) + create(new kind) at one path coalesce.
        let prior = tree("/r", false);
        prior.add(Path::new("/r/a"), 7, 10, false, "");
        let current = tree("/r", false);
        current.add(Path::new("/r/a"), 7, 10, true, "");

        let batch = diff(&current, &prior);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Update);
        assert!(batch[0].is_dir);
    }

    #[test]
    fn diff_prefers_file_id_over_ino() {
        let prior = tree("/r", false);
        prior.add(Path::new("/r/a"), 1, 10, false, "idX");
        let current = tree("/r", false);
        current.add(Path::new("/r/b"), 2, 10, false, "idX");

        let batch = diff(&current, &prior);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Rename);
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/r/a")));
    }

    #[test]
    fn diff_falls_back_to_paths_without_identity() {
        let prior = tree("/r", false);
        prior.add(Path::new("/r/a"), 0, 10, false, "");
        prior.add(Path::new("/r/c"), 0, 10, false, "");
        let current = tree("/r", false);
        current.add(Path::new("/r/a"), 0, 20, false, "");
        current.add(Path::new("/r/b"), 0, 10, false, "");

        let batch = diff(&current, &prior);
        let mut kinds: Vec<(EventType, PathBuf)> = batch
            .into_iter()
            .map(|e| (e.event_type(), e.path))
            .collect();
        kinds.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            kinds,
            vec![
                (EventType::Update, "/r/a".into()),
                (EventType::Create, "/r/b".into()),
                (EventType::Delete, "/r/c".into()),
            ]
        );
    }

    #[test]
    fn diff_removals_report_children_first() {
        let prior = tree("/r", false);
        prior.add(Path::new("/r/d"), 1, 10, true, "");
        prior.add(Path::new("/r/d/x"), 2, 10, false, "");
        let current = tree("/r", false);

        let batch = diff(&current, &prior);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].path, PathBuf::from("/r/d/x"));
        assert_eq!(batch[1].path, PathBuf::from("/r/d"));
        assert!(batch.iter().all(|e| e.event_type() == EventType::Delete));
    }
}
