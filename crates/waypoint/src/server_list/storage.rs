//! Storage locations for persisted lists.
//!
//! Saves never overwrite the current file in place. The payload goes to
//! `<file>.new` and is synced. Then the current file moves to `<file>.old`
//! and the new file takes its name. Reads fall back along the same chain,
//! so an interrupted save leaves either the previous or the new list.

use crate::error::{StorageError, StorageResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, instrument};

const LIST_EXTENSION: &str = "list";

/// A place lists can be persisted to.
pub trait ListStorage: Send + std::fmt::Debug {
    /// Human-readable location name for logs and errors.
    fn label(&self) -> &str;

    /// Modification time of the readable copy of `list`, if any.
    fn modified(&self, list: &str) -> StorageResult<Option<SystemTime>>;

    /// The readable copy of `list`, if any.
    fn read(&self, list: &str) -> StorageResult<Option<Vec<u8>>>;

    fn write(&self, list: &str, bytes: &[u8]) -> StorageResult<()>;
}

/// A directory on disk, optionally limited to a byte quota.
#[derive(Debug, Clone)]
pub struct FileStorage {
    label: String,
    dir: PathBuf,
    quota: Option<u64>,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl FileStorage {
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            label: "local".to_string(),
            dir: dir.into(),
            quota: None,
        }
    }

    /// A synced location where every list file together may use at most `quota` bytes.
    pub fn cloud(dir: impl Into<PathBuf>, quota: u64) -> Self {
        Self {
            label: "cloud".to_string(),
            dir: dir.into(),
            quota: Some(quota),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, list: &str) -> PathBuf {
        self.dir.join(format!("{list}.{LIST_EXTENSION}"))
    }

    /// The file a read should use: the current file, else a completed `.new`
    /// stranded between the two renames, else the backup.
    fn readable_path(&self, list: &str) -> Option<PathBuf> {
        let path = self.path_for(list);
        let new = with_suffix(&path, ".new");
        let old = with_suffix(&path, ".old");
        if path.exists() {
            Some(path)
        } else if new.exists() && old.exists() {
            Some(new)
        } else if old.exists() {
            Some(old)
        } else {
            None
        }
    }

    /// Bytes used by other lists in this location, backups included.
    fn used_by_others(&self, list: &str) -> StorageResult<u64> {
        let current = self.path_for(list);
        let own = [current.clone(), with_suffix(&current, ".new"), with_suffix(&current, ".old")];
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::FileRead(self.dir.clone(), e)),
        };

        let suffixes = [
            format!(".{LIST_EXTENSION}"),
            format!(".{LIST_EXTENSION}.new"),
            format!(".{LIST_EXTENSION}.old"),
        ];
        let mut used = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if own.contains(&path) || !suffixes.iter().any(|s| name.ends_with(s.as_str())) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| StorageError::FileMetadata(path.clone(), e))?;
            used += metadata.len();
        }
        Ok(used)
    }

    /// Size of the backup this list keeps once the next write completes:
    /// the current file moves to `.old`, or an existing `.old` stays.
    fn backup_after_write(&self, list: &str) -> StorageResult<u64> {
        let current = self.path_for(list);
        let old = with_suffix(&current, ".old");
        for path in [current, old] {
            match fs::metadata(&path) {
                Ok(metadata) => return Ok(metadata.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::FileMetadata(path, e)),
            }
        }
        Ok(0)
    }

    fn check_quota(&self, list: &str, needed: u64) -> StorageResult<()> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let reserved = self.used_by_others(list)? + self.backup_after_write(list)?;
        let available = quota.saturating_sub(reserved);
        if needed > available {
            return Err(StorageError::QuotaExceeded {
                location: self.label.clone(),
                needed,
                available,
            });
        }
        Ok(())
    }
}

impl ListStorage for FileStorage {
    fn label(&self) -> &str {
        &self.label
    }

    fn modified(&self, list: &str) -> StorageResult<Option<SystemTime>> {
        let Some(path) = self.readable_path(list) else {
            return Ok(None);
        };
        let metadata = fs::metadata(&path).map_err(|e| StorageError::FileMetadata(path.clone(), e))?;
        metadata
            .modified()
            .map(Some)
            .map_err(|e| StorageError::FileMetadata(path, e))
    }

    fn read(&self, list: &str) -> StorageResult<Option<Vec<u8>>> {
        let Some(path) = self.readable_path(list) else {
            return Ok(None);
        };
        debug!("Reading {} list from {}", list, path.display());
        fs::read(&path)
            .map(Some)
            .map_err(|e| StorageError::FileRead(path, e))
    }

    #[instrument(skip(self, bytes), fields(location = %self.label, bytes = bytes.len()))]
    fn write(&self, list: &str, bytes: &[u8]) -> StorageResult<()> {
        self.check_quota(list, bytes.len() as u64)?;
        fs::create_dir_all(&self.dir).map_err(|e| StorageError::FileWrite(self.dir.clone(), e))?;

        let path = self.path_for(list);
        let new = with_suffix(&path, ".new");
        let old = with_suffix(&path, ".old");

        let mut file = fs::File::create(&new).map_err(|e| StorageError::FileWrite(new.clone(), e))?;
        file.write_all(bytes)
            .map_err(|e| StorageError::FileWrite(new.clone(), e))?;
        file.sync_all()
            .map_err(|e| StorageError::FileWrite(new.clone(), e))?;
        drop(file);

        if path.exists() {
            fs::rename(&path, &old).map_err(|e| StorageError::FileRename(path.clone(), old.clone(), e))?;
        }
        fs::rename(&new, &path).map_err(|e| StorageError::FileRename(new, path.clone(), e))?;

        info!("💾 Saved {} list to {}", list, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_keeps_backup() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::local(dir.path());

        storage.write("favorites", b"first").unwrap();
        storage.write("favorites", b"second").unwrap();

        let path = storage.path_for("favorites");
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read(with_suffix(&path, ".old")).unwrap(), b"first");
        assert!(!with_suffix(&path, ".new").exists());
    }

    #[test]
    fn test_read_falls_back_along_rename_chain() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::local(dir.path());
        let path = storage.path_for("recent");
        assert_eq!(storage.read("recent").unwrap(), None);

        // Interrupted before the first rename: a lone .new is ignored.
        fs::write(with_suffix(&path, ".new"), b"partial").unwrap();
        assert_eq!(storage.read("recent").unwrap(), None);

        // Interrupted between renames: the completed .new wins.
        fs::write(with_suffix(&path, ".old"), b"previous").unwrap();
        assert_eq!(storage.read("recent").unwrap(), Some(b"partial".to_vec()));

        fs::remove_file(with_suffix(&path, ".new")).unwrap();
        assert_eq!(storage.read("recent").unwrap(), Some(b"previous".to_vec()));
    }

    #[test]
    fn test_cloud_quota_is_checked_before_writing() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::cloud(dir.path(), 10);
        storage.write("favorites", b"123456").unwrap();

        let err = storage.write("recent", b"123456").unwrap_err();
        assert!(matches!(
            err,
            StorageError::QuotaExceeded {
                needed: 6,
                available: 4,
                ..
            }
        ));
        assert!(!storage.path_for("recent").exists());
    }

    #[test]
    fn test_cloud_quota_counts_backups() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::cloud(dir.path(), 20);
        storage.write("favorites", b"123456").unwrap();
        storage.write("recent", b"123456").unwrap();

        // 8 new bytes + 6 moved to .old + 6 for recent fills the quota exactly.
        storage.write("favorites", b"12345678").unwrap();

        // The next rewrite keeps the 8-byte file as its backup.
        let err = storage.write("favorites", b"123456789").unwrap_err();
        assert!(matches!(
            err,
            StorageError::QuotaExceeded {
                needed: 9,
                available: 6,
                ..
            }
        ));

        // A stray .new left by another list counts against the quota.
        fs::write(with_suffix(&storage.path_for("recent"), ".new"), b"xxxx").unwrap();
        let err = storage.write("favorites", b"123").unwrap_err();
        assert!(matches!(
            err,
            StorageError::QuotaExceeded {
                needed: 3,
                available: 2,
                ..
            }
        ));
        assert_eq!(fs::read(storage.path_for("favorites")).unwrap(), b"12345678");
    }
}
