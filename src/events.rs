//! Logical filesystem events and the per-subscription coalescing log.
//!
//! Kernel notification streams are noisy: a single logical change often
//! arrives as several physical records, and rapid sequences (create then
//! delete, repeated writes, rename chains) are best reported as the one
//! event describing the net effect. `EventList` is the path-keyed log that
//! performs this collapse; backends append to it and `Watcher::notify`
//! drains it into a consumer batch.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::tree::FAKE_INO;

/// The logical type of an event, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Rename,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Rename => "rename",
        }
    }
}

/// One coalesced event for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The affected path (the destination path for renames).
    pub path: PathBuf,
    /// The source path of a rename, when one was observed.
    pub old_path: Option<PathBuf>,
    /// Inode identity, `FAKE_INO` when unknown.
    pub ino: u64,
    /// Windows file reference, empty when unused.
    pub file_id: String,
    /// True when the object is a directory.
    pub is_dir: bool,
    created: bool,
    deleted: bool,
}

impl Event {
    fn new(path: PathBuf, is_dir: bool) -> Self {
        Self {
            path,
            old_path: None,
            ino: FAKE_INO,
            file_id: String::new(),
            is_dir,
            created: false,
            deleted: false,
        }
    }

    /// The logical type: rename when an old path is present and the entry
    /// was neither created nor deleted since; otherwise create, delete, or
    /// the default update.
    pub fn event_type(&self) -> EventType {
        if self.old_path.is_some() && !self.created && !self.deleted {
            EventType::Rename
        } else if self.created {
            EventType::Create
        } else if self.deleted {
            EventType::Delete
        } else {
            EventType::Update
        }
    }

    /// Overwrites identity fields, keeping existing values where the new
    /// ones are sentinels.
    fn absorb_identity(&mut self, ino: u64, file_id: &str) {
        if ino != FAKE_INO {
            self.ino = ino;
        }
        if !file_id.is_empty() {
            self.file_id = file_id.to_string();
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let event_type = self.event_type();
        let is_rename = event_type == EventType::Rename;
        let mut len = 3;
        if self.ino != FAKE_INO {
            len += 1;
        }
        if !self.file_id.is_empty() {
            len += 1;
        }
        if is_rename {
            len += 1;
        }

        let mut state = serializer.serialize_struct("Event", len)?;
        state.serialize_field("type", &event_type)?;
        state.serialize_field("path", &self.path.to_string_lossy())?;
        state.serialize_field("kind", if self.is_dir { "directory" } else { "file" })?;
        if self.ino != FAKE_INO {
            state.serialize_field("ino", &self.ino)?;
        }
        if !self.file_id.is_empty() {
            state.serialize_field("fileId", &self.file_id)?;
        }
        if is_rename {
            if let Some(old_path) = &self.old_path {
                state.serialize_field("oldPath", &old_path.to_string_lossy())?;
            }
        }
        state.end()
    }
}

/// The ordered, path-keyed event log of one subscription.
///
/// Holds at most one event per path; every operation preserves that
/// invariant. Iteration order is the order in which the backend observed
/// the (surviving) events.
#[derive(Default)]
pub struct EventList {
    events: Mutex<IndexMap<PathBuf, Event>>,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `path` appeared. A pending deletion at the same path
    /// collapses into an update.
    pub fn create(&self, path: &Path, is_dir: bool, ino: u64, file_id: &str) {
        let mut events = self.events.lock();
        let event = events
            .entry(path.to_path_buf())
            .or_insert_with(|| Event::new(path.to_path_buf(), is_dir));
        if event.deleted {
            event.deleted = false;
        } else {
            event.created = true;
        }
        event.is_dir = is_dir;
        event.absorb_identity(ino, file_id);
    }

    /// Records that `path` changed in place. The default flag state is
    /// already an update, so only identity fields are touched.
    pub fn update(&self, path: &Path, ino: u64, file_id: &str) {
        let mut events = self.events.lock();
        let event = events
            .entry(path.to_path_buf())
            .or_insert_with(|| Event::new(path.to_path_buf(), false));
        event.absorb_identity(ino, file_id);
    }

    /// Records that `path` vanished. A pending creation is suppressed
    /// outright: rapidly created-then-removed paths produce no event.
    pub fn remove(&self, path: &Path, is_dir: bool, ino: u64, file_id: &str) {
        let mut events = self.events.lock();
        if matches!(events.get(path), Some(event) if event.created) {
            events.shift_remove(path);
            return;
        }
        let event = events
            .entry(path.to_path_buf())
            .or_insert_with(|| Event::new(path.to_path_buf(), is_dir));
        event.deleted = true;
        event.is_dir = is_dir;
        event.absorb_identity(ino, file_id);
    }

    /// Records that `old_path` moved to `new_path`.
    ///
    /// Anything already queued at the destination receives remove
    /// semantics first (it is being overwritten). A pending event at the
    /// source is consumed so that rename chains collapse into a single
    /// rename from the first source to the last destination; its identity
    /// fields survive where the new arguments are sentinels.
    pub fn rename(&self, old_path: &Path, new_path: &Path, is_dir: bool, ino: u64, file_id: &str) {
        let mut events = self.events.lock();

        if matches!(events.get(new_path), Some(event) if event.created) {
            events.shift_remove(new_path);
        } else if let Some(target) = events.get_mut(new_path) {
            target.deleted = true;
        }

        if let Some(source) = events.shift_remove(old_path) {
            let mut event = Event::new(new_path.to_path_buf(), is_dir);
            event.old_path = Some(
                source
                    .old_path
                    .unwrap_or_else(|| old_path.to_path_buf()),
            );
            event.ino = source.ino;
            event.file_id = source.file_id;
            event.absorb_identity(ino, file_id);
            // Drop whatever the overwrite step left at the destination;
            // the rename supersedes it and is appended in observed order.
            events.shift_remove(new_path);
            events.insert(new_path.to_path_buf(), event);
            return;
        }

        match events.get_mut(new_path) {
            Some(event) if event.deleted => {
                // Moved over a tombstone: the path still exists with new
                // content, which is an update.
                event.deleted = false;
                event.is_dir = is_dir;
                event.absorb_identity(ino, file_id);
            }
            Some(event) => {
                event.created = false;
                event.old_path = Some(old_path.to_path_buf());
                event.is_dir = is_dir;
                event.absorb_identity(ino, file_id);
            }
            None => {
                let mut event = Event::new(new_path.to_path_buf(), is_dir);
                event.old_path = Some(old_path.to_path_buf());
                event.absorb_identity(ino, file_id);
                events.insert(new_path.to_path_buf(), event);
            }
        }
    }

    /// Drains the log, returning the batch in observed order.
    pub fn take(&self) -> Vec<Event> {
        let mut events = self.events.lock();
        events.drain(..).map(|(_, event)| event).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &EventList) -> Vec<(EventType, PathBuf)> {
        list.take()
            .into_iter()
            .map(|e| (e.event_type(), e.path))
            .collect()
    }

    #[test]
    fn create_then_update_is_create() {
        let list = EventList::new();
        list.create(Path::new("/r/a"), false, 7, "");
        list.update(Path::new("/r/a"), 7, "");
        assert_eq!(paths(&list), vec![(EventType::Create, "/r/a".into())]);
    }

    #[test]
    fn delete_then_create_is_update() {
        let list = EventList::new();
        list.remove(Path::new("/r/a"), false, 7, "");
        list.create(Path::new("/r/a"), false, 9, "");
        let batch = list.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Update);
        assert_eq!(batch[0].ino, 9);
    }

    #[test]
    fn create_then_delete_is_nothing() {
        let list = EventList::new();
        list.create(Path::new("/r/a"), false, 7, "");
        list.remove(Path::new("/r/a"), false, 7, "");
        assert!(list.is_empty());
    }

    #[test]
    fn repeated_updates_collapse() {
        let list = EventList::new();
        for _ in 0..5 {
            list.update(Path::new("/r/a"), 7, "");
        }
        assert_eq!(paths(&list), vec![(EventType::Update, "/r/a".into())]);
    }

    #[test]
    fn update_then_delete_is_delete() {
        let list = EventList::new();
        list.update(Path::new("/r/a"), 7, "");
        list.remove(Path::new("/r/a"), false, 7, "");
        assert_eq!(paths(&list), vec![(EventType::Delete, "/r/a".into())]);
    }

    #[test]
    fn rename_records_old_path() {
        let list = EventList::new();
        list.rename(Path::new("/r/a"), Path::new("/r/b"), false, 7, "");
        let batch = list.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Rename);
        assert_eq!(batch[0].path, PathBuf::from("/r/b"));
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/r/a")));
    }

    #[test]
    fn rename_chain_collapses_to_first_source() {
        let list = EventList::new();
        list.rename(Path::new("/r/a"), Path::new("/r/b"), false, 7, "");
        list.rename(Path::new("/r/b"), Path::new("/r/c"), false, 0, "");
        list.rename(Path::new("/r/c"), Path::new("/r/d"), false, 0, "");
        let batch = list.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Rename);
        assert_eq!(batch[0].path, PathBuf::from("/r/d"));
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/r/a")));
        assert_eq!(batch[0].ino, 7, "identity survives sentinel arguments");
    }

    #[test]
    fn rename_consumes_pending_create() {
        let list = EventList::new();
        list.create(Path::new("/r/a"), false, 7, "");
        list.rename(Path::new("/r/a"), Path::new("/r/b"), false, 7, "");
        let batch = list.take();
        assert_eq!(batch.len(), 1, "source event was consumed");
        assert_eq!(batch[0].path, PathBuf::from("/r/b"));
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/r/a")));
    }

    #[test]
    fn unpaired_move_reports_create_at_destination() {
        // Backends without rename pairing report a move as remove+create;
        // a freshly created file moved away therefore nets a single create
        // at the destination.
        let list = EventList::new();
        list.create(Path::new("/r/a"), false, 7, "");
        list.remove(Path::new("/r/a"), false, 7, "");
        list.create(Path::new("/r/b"), false, 7, "");
        assert_eq!(paths(&list), vec![(EventType::Create, "/r/b".into())]);
    }

    #[test]
    fn rename_over_created_target_erases_target() {
        let list = EventList::new();
        list.create(Path::new("/r/x"), false, 3, "");
        list.rename(Path::new("/r/b"), Path::new("/r/x"), false, 7, "");
        let batch = list.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Rename);
        assert_eq!(batch[0].old_path, Some(PathBuf::from("/r/b")));
        assert_eq!(batch[0].ino, 7);
    }

    #[test]
    fn rename_over_pending_update_is_update() {
        let list = EventList::new();
        list.update(Path::new("/r/x"), 3, "");
        list.rename(Path::new("/r/b"), Path::new("/r/x"), false, 7, "");
        let batch = list.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Update);
        assert_eq!(batch[0].path, PathBuf::from("/r/x"));
    }

    #[test]
    fn rename_over_tombstone_is_update() {
        let list = EventList::new();
        list.remove(Path::new("/r/x"), false, 3, "");
        list.rename(Path::new("/r/b"), Path::new("/r/x"), false, 7, "");
        let batch = list.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type(), EventType::Update);
        assert_eq!(batch[0].ino, 7);
    }

    #[test]
    fn one_event_per_path_after_mixed_operations() {
        let list = EventList::new();
        list.create(Path::new("/r/a"), false, 1, "");
        list.update(Path::new("/r/a"), 1, "");
        list.remove(Path::new("/r/b"), false, 2, "");
        list.create(Path::new("/r/b"), false, 3, "");
        list.update(Path::new("/r/b"), 3, "");
        let batch = list.take();
        let mut seen = std::collections::HashSet::new();
        for event in &batch {
            assert!(seen.insert(event.path.clone()), "duplicate {:?}", event.path);
        }
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn identity_sentinels_do_not_overwrite() {
        let list = EventList::new();
        list.create(Path::new("/r/a"), false, 7, "idA");
        list.update(Path::new("/r/a"), 0, "");
        let batch = list.take();
        assert_eq!(batch[0].ino, 7);
        assert_eq!(batch[0].file_id, "idA");
    }

    #[test]
    fn serializes_to_consumer_shape() {
        let list = EventList::new();
        list.rename(Path::new("/r/a"), Path::new("/r/b"), false, 7, "");
        let batch = list.take();
        let json = serde_json::to_value(&batch[0]).unwrap();
        assert_eq!(json["type"], "rename");
        assert_eq!(json["path"], "/r/b");
        assert_eq!(json["kind"], "file");
        assert_eq!(json["oldPath"], "/r/a");
        assert_eq!(json["ino"], 7);
        assert!(json.get("fileId").is_none(), "sentinel file id omitted");

        let list = EventList::new();
        list.create(Path::new("/r/d"), true, 0, "");
        let json = serde_json::to_value(&list.take()[0]).unwrap();
        assert_eq!(json["type"], "create");
        assert_eq!(json["kind"], "directory");
        assert!(json.get("ino").is_none(), "sentinel ino omitted");
        assert!(json.get("oldPath").is_none());
    }
}
