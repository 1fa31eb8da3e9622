//! Cache inventory and eviction
//!
//! Enumeration walks the three fixed directory levels of `cache_local`
//! (`project/artifact/key`) and sums regular-file sizes per entry. An entry
//! is in use while any of its files has an inode link count above one, i.e.
//! some workspace still hardlinks it. Directories that disappear mid-walk
//! read as "entry gone" and are skipped; concurrent mutation is expected.
//!
//! Eviction policy lives outside the engine: callers decide what to remove,
//! the engine removes it.

use crate::lock::sidecar_path;
use crate::store::{CacheManager, remove_all};
use crate::{Error, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// One cache entry as seen by enumeration.
#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    /// Owning project identifier.
    pub project_id: String,
    /// Artifact name.
    pub artifact: String,
    /// Cache key.
    pub key: String,
    /// Entry directory.
    pub path: PathBuf,
    /// Total size of regular files beneath the entry.
    pub size_bytes: u64,
    /// Number of regular files beneath the entry.
    pub file_count: u64,
    /// Modification time of the entry directory.
    pub mod_time: Option<SystemTime>,
    /// Whether any file is still hardlinked from a workspace.
    pub in_use: bool,
}

impl CacheEntryInfo {
    /// Aggregate `(entry_count, total_bytes)` over a set of records.
    #[must_use]
    pub fn total(records: &[Self]) -> (usize, u64) {
        (
            records.len(),
            records.iter().map(|r| r.size_bytes).sum(),
        )
    }
}

impl CacheManager {
    /// Enumerate all cache entries with their sizes.
    ///
    /// A missing `cache_local` directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Fails only when the existing top-level directory cannot be read;
    /// deeper read failures are treated as concurrently-removed entries.
    pub fn get_cache_sizes(&self) -> Result<Vec<CacheEntryInfo>> {
        let local = self.local_cache_dir();
        if !local.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for (project_id, project_dir) in
            subdirectories(&local).map_err(|e| Error::io(e, &local, "read_dir"))?
        {
            for (artifact, artifact_dir) in subdirectories(&project_dir).unwrap_or_default() {
                for (key, entry_dir) in subdirectories(&artifact_dir).unwrap_or_default() {
                    let (size_bytes, file_count, in_use) = measure_entry(&entry_dir);
                    records.push(CacheEntryInfo {
                        project_id: project_id.clone(),
                        artifact: artifact.clone(),
                        key,
                        mod_time: fs::metadata(&entry_dir).ok().and_then(|m| m.modified().ok()),
                        path: entry_dir,
                        size_bytes,
                        file_count,
                        in_use,
                    });
                }
            }
        }
        Ok(records)
    }

    /// Remove one cache entry and its lock sidecar, then prune now-empty
    /// parent directories. Pruning failures are swallowed.
    ///
    /// # Errors
    ///
    /// Fails when the entry itself cannot be removed.
    pub fn remove_cache_entry(&self, project_id: &str, artifact: &str, key: &str) -> Result<()> {
        let artifact_dir = self.local_cache_dir().join(project_id).join(artifact);
        let entry = artifact_dir.join(key);
        remove_all(&entry)?;
        let _ = fs::remove_file(sidecar_path(&entry));
        tracing::info!(project_id, artifact, key, "Removed cache entry");

        // remove_dir refuses non-empty directories, which is exactly the
        // prune semantics wanted here.
        if fs::remove_dir(&artifact_dir).is_ok() {
            if let Some(project_dir) = artifact_dir.parent() {
                let _ = fs::remove_dir(project_dir);
            }
        }
        Ok(())
    }

    /// Remove the entire local cache, reporting `(entries, bytes)` freed.
    ///
    /// # Errors
    ///
    /// Fails when enumeration of an existing cache fails or removal fails.
    pub fn remove_all_cache(&self) -> Result<(usize, u64)> {
        let records = self.get_cache_sizes()?;
        let (entries, bytes) = CacheEntryInfo::total(&records);
        remove_all(&self.local_cache_dir())?;
        tracing::info!(entries, bytes, "Removed all cache entries");
        Ok((entries, bytes))
    }
}

/// Immediate subdirectories of `path` as `(name, path)` pairs, sorted by
/// name. Non-directories (lock sidecars in particular) are skipped.
fn subdirectories(path: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Recursively measure an entry: `(size_bytes, file_count, in_use)`.
fn measure_entry(path: &Path) -> (u64, u64, bool) {
    let mut size = 0u64;
    let mut files = 0u64;
    let mut in_use = false;
    for entry in WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            size += meta.len();
            files += 1;
            if meta.nlink() > 1 {
                in_use = true;
            }
        }
    }
    (size, files, in_use)
}
