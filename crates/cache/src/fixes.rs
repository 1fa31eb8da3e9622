//! Post-restore fixes
//!
//! Cached trees embed assumptions from the workspace that produced them:
//! absolute paths inside `node_modules/.bin` symlinks, and fingerprint
//! mtimes that cargo's incremental tracker keys on. Each toolchain that
//! needs repair after a restore registers a fix here; adding a toolchain
//! means adding a dispatch entry, not editing the store.

use crate::{Error, Result};
use rayon::prelude::*;
use std::fs::{self, File, FileTimes};
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

/// Worker threads for the fingerprint touch pool.
const TOUCH_WORKERS: usize = 8;

/// A toolchain-specific repair applied to one materialized path right after
/// restore.
trait RestoreFix: Sync {
    fn apply(&self, materialized: &Path) -> Result<()>;
}

/// Look up the fix for an artifact, if any.
fn fix_for(artifact: &str) -> Option<&'static dyn RestoreFix> {
    match artifact {
        "cargo" => Some(&CargoFingerprintFix),
        "npm" | "yarn" | "pnpm" | "bun" => Some(&NodeBinFix),
        _ => None,
    }
}

/// Apply the post-restore fix registered for `artifact` to `materialized`.
///
/// Artifacts without a registered fix are a no-op.
///
/// # Errors
///
/// Surfaces I/O failures from the fix itself.
pub fn apply_post_restore_fix(artifact: &str, materialized: &Path) -> Result<()> {
    if let Some(fix) = fix_for(artifact) {
        tracing::debug!(artifact, path = %materialized.display(), "Applying post-restore fix");
        fix.apply(materialized)?;
    }
    Ok(())
}

/// Touch `dep-*` fingerprint files so cargo re-validates instead of trusting
/// mtimes recorded in a different workspace.
///
/// Restored mtimes would make the incremental tracker declare everything
/// already built for a path that no longer matches; re-validation is cheap
/// next to the rebuild that a confused tracker causes.
struct CargoFingerprintFix;

impl RestoreFix for CargoFingerprintFix {
    fn apply(&self, materialized: &Path) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(TOUCH_WORKERS)
            .build()
            .map_err(|e| Error::Io {
                source: std::io::Error::other(e.to_string()),
                path: None,
                operation: "thread_pool".into(),
            })?;
        for profile in ["debug", "release"] {
            let fingerprint_dir = materialized.join(profile).join(".fingerprint");
            if !fingerprint_dir.is_dir() {
                continue;
            }
            let dep_files: Vec<_> = WalkDir::new(&fingerprint_dir)
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|entry| {
                    entry.file_type().is_file()
                        && entry.file_name().to_string_lossy().starts_with("dep-")
                })
                .map(walkdir::DirEntry::into_path)
                .collect();

            pool.install(|| {
                dep_files
                    .par_iter()
                    .try_for_each(|path| touch(path).map_err(|e| Error::io(e, path, "touch")))
            })?;
            tracing::debug!(
                count = dep_files.len(),
                dir = %fingerprint_dir.display(),
                "Touched fingerprint dep files"
            );
        }
        Ok(())
    }
}

fn touch(path: &Path) -> std::io::Result<()> {
    let now = SystemTime::now();
    let file = File::options().append(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(now).set_modified(now))
}

/// Remove `.bin` from restored node trees.
///
/// The directory holds symlinks whose targets encode absolute paths from the
/// installing workspace; the follow-up install re-derives it.
struct NodeBinFix;

impl RestoreFix for NodeBinFix {
    fn apply(&self, materialized: &Path) -> Result<()> {
        let bin_dir = materialized.join(".bin");
        match fs::remove_dir_all(&bin_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &bin_dir, "remove_dir_all")),
        }
    }
}
