//! Integration tests for persisted server lists
//!
//! Lists are saved to real directories and reloaded, including after
//! simulated crashes in the middle of a save.

use chrono::Utc;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use waypoint::server_list::{FileStorage, ServerList};
use waypoint::{JoinDescriptor, ServerListEntry};

fn entry(descriptor: JoinDescriptor, name: &str) -> ServerListEntry {
    ServerListEntry::new(descriptor, name, Utc::now())
}

fn favorites(dirs: &[&Path]) -> ServerList {
    dirs.iter().fold(ServerList::new("favorites"), |list, dir| {
        list.with_location(Box::new(FileStorage::local(*dir)))
    })
}

fn rows(list: &ServerList) -> Vec<(JoinDescriptor, String)> {
    list.entries()
        .iter()
        .map(|e| (e.descriptor.clone(), e.name.clone()))
        .collect()
}

#[test]
fn test_every_descriptor_kind_survives_a_reload() {
    let dir = tempdir().unwrap();
    let mut list = favorites(&[dir.path()]);
    list.add(entry(JoinDescriptor::peer(76561198000000001), "Listen Server"));
    list.add(entry(JoinDescriptor::entity("ENTITY-9"), "Session"));
    list.add(entry(JoinDescriptor::dedicated("play.example.com", 2456), "Dedicated"));
    list.add(entry(JoinDescriptor::dedicated("2001:db8::1", 2457), "V6"));
    list.save().unwrap();

    let mut reloaded = favorites(&[dir.path()]);
    assert_eq!(reloaded.load(), 4);
    assert_eq!(rows(&reloaded), rows(&list));
    assert!(!reloaded.is_dirty());
}

#[test]
fn test_merge_is_idempotent() {
    let local = tempdir().unwrap();
    let cloud = tempdir().unwrap();

    let mut a = favorites(&[local.path()]);
    a.add(entry(JoinDescriptor::peer(1), "One"));
    a.add(entry(JoinDescriptor::peer(2), "Two"));
    a.save().unwrap();

    let mut b = favorites(&[cloud.path()]);
    b.add(entry(JoinDescriptor::peer(2), "Two"));
    b.add(entry(JoinDescriptor::peer(3), "Three"));
    b.save().unwrap();

    let mut merged = favorites(&[local.path(), cloud.path()]);
    merged.load();
    let first = rows(&merged);
    assert_eq!(first.len(), 3);

    // Saving the merge to both locations and loading again changes nothing.
    merged.add(entry(JoinDescriptor::peer(2), "Two"));
    assert!(!merged.is_dirty());
    merged.save().unwrap();
    merged.load();
    assert_eq!(rows(&merged), first);
    merged.load();
    assert_eq!(rows(&merged), first);
}

#[test]
fn test_crash_before_rename_keeps_previous_list() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::local(dir.path());
    let mut list = favorites(&[dir.path()]);
    list.add(entry(JoinDescriptor::peer(1), "Before"));
    list.save().unwrap();

    // Interrupted while writing the replacement.
    let current = storage.path_for("favorites");
    let partial = current.with_extension("list.new");
    fs::write(&partial, [0xFF, 0x01]).unwrap();

    let mut reloaded = favorites(&[dir.path()]);
    assert_eq!(reloaded.load(), 1);
    assert_eq!(reloaded.entries()[0].name, "Before");

    // The next save replaces the stray file.
    reloaded.add(entry(JoinDescriptor::peer(2), "After"));
    reloaded.save().unwrap();
    assert!(!partial.exists());

    let mut again = favorites(&[dir.path()]);
    assert_eq!(again.load(), 2);
}

#[test]
fn test_crash_between_renames_recovers_new_file() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::local(dir.path());
    let mut list = favorites(&[dir.path()]);
    list.add(entry(JoinDescriptor::peer(1), "Old"));
    list.save().unwrap();
    list.add(entry(JoinDescriptor::peer(2), "New"));
    list.save().unwrap();

    // Current moved aside to .old, completed .new not yet renamed.
    let current = storage.path_for("favorites");
    let old = current.with_extension("list.old");
    let new = current.with_extension("list.new");
    fs::rename(&current, &new).unwrap();
    assert!(old.exists());

    let mut reloaded = favorites(&[dir.path()]);
    assert_eq!(reloaded.load(), 2);
    assert_eq!(reloaded.entries()[1].name, "New");
}

#[test]
fn test_recent_list_keeps_latest_joins_first() {
    let dir = tempdir().unwrap();
    let mut recent = ServerList::new("recent")
        .with_max_entries(3)
        .with_location(Box::new(FileStorage::local(dir.path())));

    for id in 1..=4 {
        recent.add_to_beginning(entry(JoinDescriptor::peer(id), &format!("Server {id}")));
    }
    recent.add_to_beginning(entry(JoinDescriptor::peer(3), "Server 3"));
    recent.flush().unwrap();

    let mut reloaded = ServerList::new("recent")
        .with_max_entries(3)
        .with_location(Box::new(FileStorage::local(dir.path())));
    reloaded.load();
    let ids: Vec<JoinDescriptor> = reloaded.entries().iter().map(|e| e.descriptor.clone()).collect();
    assert_eq!(
        ids,
        vec![JoinDescriptor::peer(3), JoinDescriptor::peer(4), JoinDescriptor::peer(2)]
    );
}
