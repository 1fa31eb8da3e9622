//! Advisory cache-entry locks
//!
//! Mutations of one cache entry are serialized across processes through a
//! BSD-style advisory lock on a `<entry>.lock` sidecar file. The lock is
//! non-blocking: a held lock means another process is already performing the
//! guarded operation, which callers treat as "nothing to do", not as an
//! error.

use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// An acquired advisory lock over one cache entry.
///
/// The lock is released on drop. The sidecar file is left in place; entry
/// removal cleans it up alongside the entry.
#[derive(Debug)]
pub struct EntryLock {
    file: File,
    path: PathBuf,
}

impl EntryLock {
    /// Try to take the exclusive advisory lock for `entry_path`.
    ///
    /// Returns `Ok(None)` when another process holds the lock.
    ///
    /// # Errors
    ///
    /// Fails if the sidecar file cannot be created or opened.
    pub fn try_acquire(entry_path: &Path) -> Result<Option<Self>> {
        let path = sidecar_path(entry_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "mkdir"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(e, &path, "open"))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(lock = %path.display(), "Acquired cache entry lock");
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(lock = %path.display(), "Cache entry locked by another process");
                Ok(None)
            }
            Err(e) => Err(Error::io(e, &path, "flock")),
        }
    }

    /// The sidecar file this lock holds.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// The sidecar lock file for a cache entry: `<entry>.lock`.
#[must_use]
pub fn sidecar_path(entry_path: &Path) -> PathBuf {
    let mut name = entry_path
        .file_name()
        .map_or_else(Default::default, std::ffi::OsStr::to_os_string);
    name.push(".lock");
    entry_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sidecar_sits_next_to_the_entry() {
        let path = sidecar_path(Path::new("/cache/p/cargo/0123456789abcdef"));
        assert_eq!(path, Path::new("/cache/p/cargo/0123456789abcdef.lock"));
    }

    #[test]
    fn acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let entry = tmp.path().join("cargo").join("0123456789abcdef");

        let lock = EntryLock::try_acquire(&entry).unwrap();
        assert!(lock.is_some());
        drop(lock);

        // Released on drop; a fresh acquire succeeds.
        assert!(EntryLock::try_acquire(&entry).unwrap().is_some());
    }

    #[test]
    fn contended_lock_is_a_silent_skip() {
        let tmp = TempDir::new().unwrap();
        let entry = tmp.path().join("cargo").join("0123456789abcdef");

        let held = EntryLock::try_acquire(&entry).unwrap();
        assert!(held.is_some());

        // flock is per open-file-description, so a second open contends even
        // within one process.
        let second = EntryLock::try_acquire(&entry).unwrap();
        assert!(second.is_none());
    }
}
