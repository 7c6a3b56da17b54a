//! Ban, allow and admin lists.
//!
//! List files hold one identity per line; blank lines and lines starting
//! with `#` are ignored. An entry may be the stable `Platform_id` form or,
//! in files written by older builds, the bare user id. Both forms match.

use crate::error::{HandshakeError, HandshakeResult, StorageError, StorageResult};
use crate::types::PlatformUserId;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityList {
    entries: BTreeSet<String>,
}

impl IdentityList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(contents: &str) -> Self {
        Self {
            entries: contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect(),
        }
    }

    /// Loads `path`, treating a missing file as an empty list.
    pub fn load(path: &Path) -> StorageResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let list = Self::parse(&contents);
                debug!("Loaded {} identities from {}", list.len(), path.display());
                Ok(list)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(StorageError::FileRead(path.to_path_buf(), e)),
        }
    }

    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let mut contents = String::new();
        for entry in &self.entries {
            contents.push_str(entry);
            contents.push('\n');
        }
        fs::write(path, contents).map_err(|e| StorageError::FileWrite(path.to_path_buf(), e))
    }

    pub fn contains(&self, id: &PlatformUserId) -> bool {
        self.entries.contains(&id.to_string()) || self.entries.contains(id.raw_id())
    }

    /// Adds the stable form of `id`. Returns false if it already matched.
    pub fn add(&mut self, id: &PlatformUserId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.entries.insert(id.to_string())
    }

    /// Removes every form of `id`.
    pub fn remove(&mut self, id: &PlatformUserId) -> bool {
        let stable = self.entries.remove(&id.to_string());
        let raw = self.entries.remove(id.raw_id());
        stable || raw
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessLists {
    pub banned: IdentityList,
    /// When non-empty, only listed identities may join
    pub allowed: IdentityList,
    pub admins: IdentityList,
}

impl AccessLists {
    /// Loads `bannedlist.txt`, `permittedlist.txt` and `adminlist.txt` from `dir`.
    pub fn load_dir(dir: &Path) -> StorageResult<Self> {
        let lists = Self {
            banned: IdentityList::load(&dir.join("bannedlist.txt"))?,
            allowed: IdentityList::load(&dir.join("permittedlist.txt"))?,
            admins: IdentityList::load(&dir.join("adminlist.txt"))?,
        };
        info!(
            "🛡️ Access lists loaded: {} banned, {} allowed, {} admins",
            lists.banned.len(),
            lists.allowed.len(),
            lists.admins.len()
        );
        Ok(lists)
    }

    pub fn check(&self, id: &PlatformUserId) -> HandshakeResult<()> {
        if self.banned.contains(id) {
            return Err(HandshakeError::Banned);
        }
        if !self.allowed.is_empty() && !self.allowed.contains(id) {
            return Err(HandshakeError::NotAllowlisted);
        }
        Ok(())
    }

    pub fn is_admin(&self, id: &PlatformUserId) -> bool {
        self.admins.contains(id)
    }
}
