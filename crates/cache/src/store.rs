//! Cache store operations
//!
//! [`CacheManager`] owns the three-layer cache layout and the operations the
//! orchestrator drives it with:
//!
//! - [`CacheManager::prepare_entries`]: fingerprint each artifact and report
//!   hit/miss. Presence of the entry directory is the hit signal; there is
//!   no metadata file.
//! - [`CacheManager::restore`]: materialize a hit into the workspace.
//! - [`CacheManager::store`]: move a freshly built tree into the cache and
//!   hardlink it back so the build keeps working in place.
//! - [`CacheManager::sync`]: consolidate late writes into the cache;
//!   idempotent and race-safe against sibling processes.
//! - [`CacheManager::seed_from_root`]: promote a matching artifact tree at
//!   the project root into the cache without disturbing it.
//!
//! Entries are only ever replaced whole (`remove_dir_all` + recreate), never
//! edited in place; the hardlink fanout adds links to immutable inodes.
//! All operations return only once the work is complete or aborted.

use crate::conflicts;
use crate::fingerprint::compute_cache_key;
use crate::fixes::apply_post_restore_fix;
use crate::lock::EntryLock;
use crate::replicate::{self, SeedOptions, seed_tree};
use crate::{Error, Result};
use mono_core::ArtifactSpec;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A prepared cache entry for one artifact in one workspace.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The artifact descriptor this entry caches.
    pub artifact: ArtifactSpec,
    /// The computed cache key.
    pub key: String,
    /// The entry directory under `cache_local`.
    pub path: PathBuf,
    /// Absolute workspace paths the entry materializes.
    pub workspace_paths: Vec<PathBuf>,
    /// Whether the entry directory already exists.
    pub hit: bool,
}

/// Options for [`CacheManager::sync`].
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Re-create moved trees in the workspace as hardlinks of the cache
    /// entry. Disable when the workspace is being torn down anyway.
    pub hardlink_back: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            hardlink_back: true,
        }
    }
}

/// Handle over the on-disk cache.
///
/// Carries the resolved home directory; everything else is derived. Cheap to
/// clone, safe to share across tasks.
#[derive(Debug, Clone)]
pub struct CacheManager {
    home: PathBuf,
}

impl CacheManager {
    /// Create a manager over the default mono home.
    ///
    /// # Errors
    ///
    /// Fails if the home directory cannot be resolved.
    pub fn new() -> Result<Self> {
        Ok(Self {
            home: mono_core::home_dir()?,
        })
    }

    /// Create a manager over an explicit home directory.
    #[must_use]
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// The home directory this manager operates under.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// The `cache_local` directory under this manager's home.
    #[must_use]
    pub fn local_cache_dir(&self) -> PathBuf {
        mono_core::local_cache_dir(&self.home)
    }

    /// The `cache_global` directory under this manager's home.
    #[must_use]
    pub fn global_cache_dir(&self) -> PathBuf {
        mono_core::global_cache_dir(&self.home)
    }

    /// Create the cache directory skeleton: `cache_local/` and the shared
    /// `cache_global` subdirectories.
    ///
    /// # Errors
    ///
    /// Fails if a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<()> {
        let local = self.local_cache_dir();
        fs::create_dir_all(&local).map_err(|e| Error::io(e, &local, "mkdir"))?;
        let global = self.global_cache_dir();
        for tool in ["cargo", "npm", "yarn", "pnpm", "sccache"] {
            let dir = global.join(tool);
            fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "mkdir"))?;
        }
        Ok(())
    }

    /// The cache entry path for one `(project, artifact, key)` triple.
    #[must_use]
    pub fn entry_path(&self, project_root: &Path, artifact: &str, key: &str) -> PathBuf {
        mono_core::artifact_cache_path(&self.home, project_root, artifact, key)
    }

    /// Fingerprint each artifact in `workspace` and resolve its cache entry.
    ///
    /// # Errors
    ///
    /// Fails when a cache key cannot be computed (unreadable key-file or
    /// failing key-command).
    pub fn prepare_entries(
        &self,
        artifacts: &[ArtifactSpec],
        project_root: &Path,
        workspace: &Path,
    ) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let key = compute_cache_key(artifact, workspace)?;
            let path = self.entry_path(project_root, &artifact.name, &key);
            let hit = path.is_dir();
            tracing::debug!(
                artifact = %artifact.name,
                key,
                hit,
                "Prepared cache entry"
            );
            entries.push(CacheEntry {
                artifact: artifact.clone(),
                key,
                path,
                workspace_paths: artifact
                    .paths
                    .iter()
                    .map(|rel| workspace.join(rel))
                    .collect(),
                hit,
            });
        }
        Ok(entries)
    }

    /// Materialize a cached entry into its workspace paths.
    ///
    /// Destructive: each workspace path is removed and rebuilt from the
    /// cache. The caller has already decided to adopt the cache; on failure
    /// it treats the artifact as a miss and rebuilds.
    ///
    /// # Errors
    ///
    /// Surfaces replication errors and post-restore fix failures.
    pub async fn restore(&self, entry: &CacheEntry) -> Result<()> {
        for workspace_path in &entry.workspace_paths {
            let base = base_name(workspace_path)?;
            let mut src = entry.path.join(base);
            if !src.is_dir() {
                // Compatibility shim: entries written by earlier layouts
                // keyed their single child by artifact name instead of the
                // materialized path's base name.
                src = entry.path.join(&entry.artifact.name);
            }

            remove_all(workspace_path)?;
            let files = seed_tree(
                &src,
                workspace_path,
                SeedOptions::for_artifact(&entry.artifact.name, "restoring"),
            )
            .await?;
            apply_post_restore_fix(&entry.artifact.name, workspace_path)?;
            tracing::info!(
                artifact = %entry.artifact.name,
                key = %entry.key,
                files,
                path = %workspace_path.display(),
                "Restored artifact from cache"
            );
        }
        Ok(())
    }

    /// Move a freshly built tree into the cache, then hardlink it back into
    /// the workspace so the build keeps working in place.
    ///
    /// The move is a same-device `rename`; cross-device store is not
    /// attempted here (`sync` owns that path).
    ///
    /// # Errors
    ///
    /// Surfaces rename and hardlink failures.
    pub async fn store(&self, entry: &CacheEntry) -> Result<()> {
        fs::create_dir_all(&entry.path).map_err(|e| Error::io(e, &entry.path, "mkdir"))?;
        for workspace_path in &entry.workspace_paths {
            if !workspace_path.exists() {
                continue;
            }
            let target = entry.path.join(base_name(workspace_path)?);
            fs::rename(workspace_path, &target)
                .map_err(|e| Error::io(e, workspace_path, "rename"))?;
            let files = {
                let target = target.clone();
                let workspace_path = workspace_path.clone();
                tokio::task::spawn_blocking(move || {
                    replicate::hardlink_tree(&target, &workspace_path)
                })
                .await
                .map_err(join_error)??
            };
            tracing::info!(
                artifact = %entry.artifact.name,
                key = %entry.key,
                files,
                path = %workspace_path.display(),
                "Stored artifact into cache"
            );
        }
        Ok(())
    }

    /// Consolidate late workspace writes into the cache.
    ///
    /// Idempotent: an already-cached key is skipped. Race-safe: the
    /// per-entry advisory lock decides which process performs the move;
    /// losers skip silently.
    ///
    /// # Errors
    ///
    /// Refuses with [`Error::BuildInProgress`] when an in-flight build
    /// marker exists; surfaces move/replication failures, including the
    /// composite [`Error::Recovery`] when a rollback also failed.
    pub async fn sync(
        &self,
        artifacts: &[ArtifactSpec],
        project_root: &Path,
        workspace: &Path,
        opts: SyncOptions,
    ) -> Result<()> {
        for artifact in artifacts {
            if let Some(marker) = conflicts::build_in_progress(&artifact.name, workspace) {
                return Err(Error::BuildInProgress {
                    artifact: artifact.name.clone(),
                    marker,
                });
            }

            let key = compute_cache_key(artifact, workspace)?;
            let cache_path = self.entry_path(project_root, &artifact.name, &key);
            if cache_path.is_dir() {
                tracing::debug!(
                    artifact = %artifact.name,
                    key,
                    "Cache entry already present, sync is a no-op"
                );
                continue;
            }

            for rel in &artifact.paths {
                let workspace_path = workspace.join(rel);
                if !workspace_path.exists() {
                    continue;
                }
                let Some(lock) = EntryLock::try_acquire(&cache_path)? else {
                    // Another process is consolidating this key.
                    continue;
                };
                let target = cache_path.join(base_name(&workspace_path)?);
                if target.exists() {
                    drop(lock);
                    continue;
                }
                fs::create_dir_all(&cache_path)
                    .map_err(|e| Error::io(e, &cache_path, "mkdir"))?;

                self.move_into_cache(artifact, &workspace_path, &cache_path, &target, opts)
                    .await?;
                tracing::info!(
                    artifact = %artifact.name,
                    key,
                    path = %workspace_path.display(),
                    "Synced artifact into cache"
                );
                drop(lock);
            }
        }
        Ok(())
    }

    /// Move one workspace tree into the cache under an already-held lock,
    /// handling the cross-device fallback and the hardlink-back fanout.
    async fn move_into_cache(
        &self,
        artifact: &ArtifactSpec,
        workspace_path: &Path,
        cache_path: &Path,
        target: &Path,
        opts: SyncOptions,
    ) -> Result<()> {
        let mut renamed = true;
        match fs::rename(workspace_path, target) {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                renamed = false;
                let seeded = seed_tree(
                    workspace_path,
                    target,
                    SeedOptions::for_artifact(&artifact.name, "syncing"),
                )
                .await;
                if let Err(e) = seeded {
                    // Best-effort cleanup of the partial entry; its own
                    // failure is swallowed.
                    let _ = fs::remove_dir_all(cache_path);
                    return Err(e);
                }
            }
            Err(e) => {
                let _ = fs::remove_dir_all(cache_path);
                return Err(Error::io(e, workspace_path, "rename"));
            }
        }

        if opts.hardlink_back {
            let fanned_out = {
                let target = target.to_path_buf();
                let workspace_path = workspace_path.to_path_buf();
                tokio::task::spawn_blocking(move || {
                    remove_all(&workspace_path)?;
                    replicate::hardlink_tree(&target, &workspace_path)
                })
                .await
                .map_err(join_error)?
            };
            if let Err(primary) = fanned_out {
                return Err(recover_sync(workspace_path, target, cache_path, primary));
            }
        } else if !renamed {
            // The copy left the original in place; without the fanout the
            // workspace tree is dropped.
            remove_all(workspace_path)?;
        }
        Ok(())
    }

    /// Promote pre-existing artifact trees at the project root into the
    /// cache, when the root's fingerprint matches the workspace's.
    ///
    /// The root tree is never modified; a mismatching or mid-build root is
    /// skipped rather than risked into the cache.
    ///
    /// # Errors
    ///
    /// Surfaces fingerprint and replication failures. A failed replication
    /// removes the partial entry before returning.
    pub async fn seed_from_root(
        &self,
        artifacts: &[ArtifactSpec],
        project_root: &Path,
        workspace: &Path,
    ) -> Result<()> {
        if project_root == workspace {
            return Ok(());
        }
        for artifact in artifacts {
            let workspace_key = compute_cache_key(artifact, workspace)?;
            let cache_path = self.entry_path(project_root, &artifact.name, &workspace_key);
            if cache_path.is_dir() {
                continue;
            }
            let root_key = compute_cache_key(artifact, project_root)?;
            if root_key != workspace_key {
                tracing::debug!(
                    artifact = %artifact.name,
                    root_key,
                    workspace_key,
                    "Project root is out of date, not seeding"
                );
                continue;
            }
            if conflicts::build_in_progress(&artifact.name, project_root).is_some() {
                tracing::debug!(
                    artifact = %artifact.name,
                    "Build in progress at project root, not seeding"
                );
                continue;
            }

            let Some(lock) = EntryLock::try_acquire(&cache_path)? else {
                continue;
            };
            if cache_path.is_dir() {
                drop(lock);
                continue;
            }
            for rel in &artifact.paths {
                let root_path = project_root.join(rel);
                if !root_path.exists() {
                    continue;
                }
                fs::create_dir_all(&cache_path)
                    .map_err(|e| Error::io(e, &cache_path, "mkdir"))?;
                let target = cache_path.join(base_name(&root_path)?);
                match seed_tree(
                    &root_path,
                    &target,
                    SeedOptions::for_artifact(&artifact.name, "seeding"),
                )
                .await
                {
                    Ok(files) => {
                        tracing::info!(
                            artifact = %artifact.name,
                            key = %workspace_key,
                            files,
                            "Seeded cache from project root"
                        );
                    }
                    Err(e) => {
                        let _ = fs::remove_dir_all(&cache_path);
                        return Err(e);
                    }
                }
            }
            drop(lock);
        }
        Ok(())
    }
}

/// Best-effort rollback after a failed hardlink-back: move the cache copy
/// back to the workspace and drop the entry. Both failures are reported when
/// the rollback fails too.
fn recover_sync(
    workspace_path: &Path,
    target: &Path,
    cache_path: &Path,
    primary: Error,
) -> Error {
    let rollback = (|| -> Result<()> {
        remove_all(workspace_path)?;
        fs::rename(target, workspace_path).map_err(|e| Error::io(e, target, "rename"))?;
        remove_all(cache_path)
    })();
    match rollback {
        Ok(()) => primary,
        Err(recovery) => Error::Recovery {
            primary: Box::new(primary),
            recovery: Box::new(recovery),
        },
    }
}

/// `remove_dir_all` tolerating an already-absent path.
pub(crate) fn remove_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        // The path may be a plain file rather than a directory.
        Err(e) if e.kind() == ErrorKind::NotADirectory => {
            fs::remove_file(path).map_err(|e| Error::io(e, path, "remove_file"))
        }
        Err(e) => Err(Error::io(e, path, "remove_dir_all")),
    }
}

fn base_name(path: &Path) -> Result<&OsStr> {
    path.file_name().ok_or_else(|| Error::Io {
        source: std::io::Error::new(ErrorKind::InvalidInput, "path has no final component"),
        path: Some(path.into()),
        operation: "basename".into(),
    })
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io {
        source: std::io::Error::other(e.to_string()),
        path: None,
        operation: "join".into(),
    }
}

fn is_cross_device(e: &std::io::Error) -> bool {
    if e.kind() == ErrorKind::CrossesDevices {
        return true;
    }
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EXDEV) {
        return true;
    }
    false
}
