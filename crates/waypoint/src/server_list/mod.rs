//! # Server lists
//!
//! Named, ordered lists of join targets (favorites, recent servers) backed
//! by zero or more storage locations.
//!
//! Loading merges every location that has a copy, newest copy first, and
//! keeps the first occurrence of each descriptor. Mutations only touch
//! memory; `save`/`flush` write every location.
//!
//! A list has a single writer. Callers sharing one across tasks must wrap it
//! themselves.

pub mod codec;
pub mod storage;

use crate::error::{StorageError, StorageResult};
use crate::types::{JoinDescriptor, ServerListEntry};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use tracing::{debug, info, warn};

pub use storage::{FileStorage, ListStorage};

pub const DEFAULT_MAX_ENTRIES: usize = 200;

#[derive(Debug)]
pub struct ServerList {
    name: String,
    max_entries: usize,
    locations: Vec<Box<dyn ListStorage>>,
    entries: Vec<ServerListEntry>,
    dirty: bool,
}

impl ServerList {
    /// An in-memory list; add locations to persist it.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
            locations: Vec::new(),
            entries: Vec::new(),
            dirty: false,
        }
    }

    pub fn with_location(mut self, location: Box<dyn ListStorage>) -> Self {
        self.locations.push(location);
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self.evict();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[ServerListEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn position(&self, descriptor: &JoinDescriptor) -> Option<usize> {
        self.entries.iter().position(|e| &e.descriptor == descriptor)
    }

    pub fn contains(&self, descriptor: &JoinDescriptor) -> bool {
        self.position(descriptor).is_some()
    }

    /// Replaces the in-memory list with the merge of every location.
    ///
    /// A location that fails to read or decode is skipped. Returns the
    /// number of entries loaded.
    pub fn load(&mut self) -> usize {
        let mut sources = Vec::new();
        for (index, location) in self.locations.iter().enumerate() {
            match location.modified(&self.name) {
                Ok(Some(modified)) => sources.push((modified, index)),
                Ok(None) => debug!("No {} list in {}", self.name, location.label()),
                Err(e) => warn!("Skipping {} list in {}: {}", self.name, location.label(), e),
            }
        }
        sources.sort_by_key(|(modified, _)| Reverse(*modified));

        let mut merged: Vec<ServerListEntry> = Vec::new();
        for (modified, index) in sources {
            let location = &self.locations[index];
            let decoded = location
                .read(&self.name)
                .and_then(|bytes| codec::decode(&bytes.unwrap_or_default(), DateTime::<Utc>::from(modified)));
            match decoded {
                Ok(entries) => {
                    debug!("{} entries in {} list at {}", entries.len(), self.name, location.label());
                    for entry in entries {
                        if !merged.iter().any(|e| e.descriptor == entry.descriptor) {
                            merged.push(entry);
                        }
                    }
                }
                Err(e) => warn!("Skipping {} list in {}: {}", self.name, location.label(), e),
            }
        }

        self.entries = merged;
        self.evict();
        self.dirty = false;
        info!("📂 Loaded {} list: {} entries", self.name, self.entries.len());
        self.entries.len()
    }

    /// Appends `entry` unless its descriptor is already listed. Returns
    /// whether the list changed; a full list drops the new entry.
    pub fn add(&mut self, entry: ServerListEntry) -> bool {
        if self.contains(&entry.descriptor) || self.entries.len() >= self.max_entries {
            return false;
        }
        self.entries.push(entry);
        self.dirty = true;
        true
    }

    /// Moves or inserts `entry` at the front, evicting from the tail when full.
    pub fn add_to_beginning(&mut self, entry: ServerListEntry) {
        if let Some(index) = self.position(&entry.descriptor) {
            self.entries.remove(index);
        }
        self.entries.insert(0, entry);
        self.evict();
        self.dirty = true;
    }

    pub fn remove(&mut self, descriptor: &JoinDescriptor) -> bool {
        match self.position(descriptor) {
            Some(index) => {
                self.entries.remove(index);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn swap(&mut self, a: usize, b: usize) -> bool {
        if a >= self.entries.len() || b >= self.entries.len() {
            return false;
        }
        if a != b {
            self.entries.swap(a, b);
            self.dirty = true;
        }
        true
    }

    /// Updates the cached display name when `at` is newer than the stored one.
    pub fn update_name(&mut self, descriptor: &JoinDescriptor, name: &str, at: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| &e.descriptor == descriptor) else {
            return false;
        };
        if at <= entry.name_captured_at || entry.name == name {
            return false;
        }
        entry.name = name.to_string();
        entry.name_captured_at = at;
        self.dirty = true;
        true
    }

    /// Writes the list to every location.
    ///
    /// All locations are attempted; the first failure is returned and the
    /// list stays dirty.
    pub fn save(&mut self) -> StorageResult<()> {
        let bytes = codec::encode(&self.entries);
        let mut first_error: Option<StorageError> = None;
        for location in &self.locations {
            if let Err(e) = location.write(&self.name, &bytes) {
                warn!("Failed to save {} list to {}: {}", self.name, location.label(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.dirty = false;
                Ok(())
            }
        }
    }

    /// Saves only when there are unsaved changes.
    pub fn flush(&mut self) -> StorageResult<()> {
        if self.dirty {
            self.save()
        } else {
            Ok(())
        }
    }

    fn evict(&mut self) {
        if self.entries.len() > self.max_entries {
            debug!(
                "Evicting {} entries from the tail of {}",
                self.entries.len() - self.max_entries,
                self.name
            );
            self.entries.truncate(self.max_entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn entry(descriptor: JoinDescriptor, name: &str) -> ServerListEntry {
        ServerListEntry::new(descriptor, name, Utc::now())
    }

    fn descriptors(list: &ServerList) -> Vec<JoinDescriptor> {
        list.entries().iter().map(|e| e.descriptor.clone()).collect()
    }

    fn set_mtime(storage: &FileStorage, list: &str, at: SystemTime) {
        fs::File::options()
            .write(true)
            .open(storage.path_for(list))
            .unwrap()
            .set_modified(at)
            .unwrap();
    }

    #[test]
    fn test_mutations() {
        let mut list = ServerList::new("recent").with_max_entries(3);
        assert!(list.add(entry(JoinDescriptor::peer(1), "One")));
        assert!(!list.add(entry(JoinDescriptor::peer(1), "One again")));
        list.add(entry(JoinDescriptor::peer(2), "Two"));
        list.add(entry(JoinDescriptor::peer(3), "Three"));
        assert!(!list.add(entry(JoinDescriptor::peer(4), "Four")));

        list.add_to_beginning(entry(JoinDescriptor::peer(4), "Four"));
        assert_eq!(
            descriptors(&list),
            vec![JoinDescriptor::peer(4), JoinDescriptor::peer(1), JoinDescriptor::peer(2)]
        );

        list.add_to_beginning(entry(JoinDescriptor::peer(2), "Two"));
        assert_eq!(descriptors(&list)[0], JoinDescriptor::peer(2));
        assert_eq!(list.len(), 3);

        assert!(list.swap(0, 2));
        assert!(!list.swap(0, 3));
        assert!(list.remove(&JoinDescriptor::peer(4)));
        assert!(!list.remove(&JoinDescriptor::peer(4)));
        assert_eq!(descriptors(&list), vec![JoinDescriptor::peer(1), JoinDescriptor::peer(2)]);
    }

    #[test]
    fn test_load_merges_newest_location_first() {
        let local_dir = tempdir().unwrap();
        let cloud_dir = tempdir().unwrap();
        let local = FileStorage::local(local_dir.path());
        let cloud = FileStorage::cloud(cloud_dir.path(), 1 << 20);

        local
            .write(
                "favorites",
                &codec::encode(&[
                    entry(JoinDescriptor::peer(1), "A"),
                    entry(JoinDescriptor::peer(2), "B (local)"),
                ]),
            )
            .unwrap();
        cloud
            .write(
                "favorites",
                &codec::encode(&[
                    entry(JoinDescriptor::peer(2), "B (cloud)"),
                    entry(JoinDescriptor::entity("C"), "C"),
                ]),
            )
            .unwrap();
        let now = SystemTime::now();
        set_mtime(&local, "favorites", now - Duration::from_secs(60));
        set_mtime(&cloud, "favorites", now);

        let mut list = ServerList::new("favorites")
            .with_location(Box::new(local))
            .with_location(Box::new(cloud));
        assert_eq!(list.load(), 3);
        assert_eq!(
            descriptors(&list),
            vec![JoinDescriptor::peer(2), JoinDescriptor::entity("C"), JoinDescriptor::peer(1)]
        );
        assert_eq!(list.entries()[0].name, "B (cloud)");

        let first = list.entries().to_vec();
        list.load();
        assert_eq!(list.entries(), first.as_slice());
    }

    #[test]
    fn test_unreadable_location_is_skipped() {
        let good_dir = tempdir().unwrap();
        let bad_dir = tempdir().unwrap();
        let good = FileStorage::local(good_dir.path());
        let bad = FileStorage::local(bad_dir.path()).with_label("future");
        good.write("favorites", &codec::encode(&[entry(JoinDescriptor::peer(1), "A")]))
            .unwrap();
        let mut future = codec::encode(&[entry(JoinDescriptor::peer(9), "Z")]);
        future[..4].copy_from_slice(&99u32.to_le_bytes());
        bad.write("favorites", &future).unwrap();

        let mut list = ServerList::new("favorites")
            .with_location(Box::new(bad))
            .with_location(Box::new(good));
        assert_eq!(list.load(), 1);
        assert_eq!(descriptors(&list), vec![JoinDescriptor::peer(1)]);
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::local(dir.path());
        let path = storage.path_for("favorites");
        let mut list = ServerList::new("favorites").with_location(Box::new(storage));

        list.flush().unwrap();
        assert!(!path.exists());

        list.add(entry(JoinDescriptor::dedicated("play.example.com", 2456), "Play"));
        assert!(list.is_dirty());
        list.flush().unwrap();
        assert!(path.exists());
        assert!(!list.is_dirty());
    }

    #[test]
    fn test_quota_failure_keeps_list_dirty() {
        let dir = tempdir().unwrap();
        let mut list = ServerList::new("favorites").with_location(Box::new(FileStorage::cloud(dir.path(), 4)));
        list.add(entry(JoinDescriptor::peer(1), "Too big for the quota"));
        assert!(matches!(list.save(), Err(StorageError::QuotaExceeded { .. })));
        assert!(list.is_dirty());
    }

    #[test]
    fn test_update_name_requires_newer_capture() {
        let mut list = ServerList::new("recent");
        let at = Utc::now();
        list.add(ServerListEntry::new(JoinDescriptor::peer(1), "Old", at));
        assert!(!list.update_name(&JoinDescriptor::peer(1), "Older", at));
        assert!(list.update_name(&JoinDescriptor::peer(1), "New", at + chrono::Duration::seconds(1)));
        assert_eq!(list.entries()[0].name, "New");
    }
}
