//! Parallel tree replication
//!
//! Two entry points share the per-file logic in [`link_or_copy`]:
//!
//! - [`seed_tree`]: two-phase parallel replication. A single-threaded walk
//!   collects directories (pre-order) and files in lexical order, applying
//!   artifact-specific skip rules; the apply phase creates every directory
//!   first and then fans files out to a worker pool over a bounded queue.
//! - [`hardlink_tree`]: single-threaded recursive replication without
//!   workers, timeouts or skip rules, for trees the caller already knows are
//!   small and well-formed (fanning an immutable cache entry back into a
//!   workspace).
//!
//! Regular files are hardlinked, falling back to a byte copy when the link
//! fails with a cross-device or unsupported-operation error. Symlinks are
//! never hardlinked or followed: their literal target strings are recreated
//! verbatim at the destination.
//!
//! Each per-file operation runs on the blocking pool with a timeout on the
//! wait. An expired wait abandons the operation and surfaces
//! [`Error::FileTimeout`], but the underlying I/O keeps running to
//! completion in the background; this leakage is accepted so that one file
//! stuck behind filesystem contention cannot wedge the whole operation.

use crate::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Default number of replication workers.
pub const DEFAULT_WORKERS: usize = 16;

/// Default no-progress watchdog timeout.
pub const DEFAULT_PROGRESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-file timeout.
pub const DEFAULT_FILE_TIMEOUT: Duration = Duration::from_secs(10);

/// Watchdog wake interval.
const WATCHDOG_TICK: Duration = Duration::from_secs(5);

/// Depth of the bounded file queue between the feeder and the workers.
const QUEUE_DEPTH: usize = 256;

/// Options for [`seed_tree`].
#[derive(Debug, Clone)]
pub struct SeedOptions {
    /// Artifact name, selects the skip rules.
    pub artifact: String,
    /// Operation name for log and error messages, e.g. "restoring".
    pub operation: String,
    /// Number of replication workers.
    pub workers: usize,
    /// Abort when no file completes for this long.
    pub progress_timeout: Duration,
    /// Abandon the wait on a single file after this long. The underlying
    /// I/O task keeps running in the background.
    pub file_timeout: Duration,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            artifact: String::new(),
            operation: "seeding".into(),
            workers: DEFAULT_WORKERS,
            progress_timeout: DEFAULT_PROGRESS_TIMEOUT,
            file_timeout: DEFAULT_FILE_TIMEOUT,
        }
    }
}

impl SeedOptions {
    /// Options for replicating `artifact` under the given operation name.
    #[must_use]
    pub fn for_artifact(artifact: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            operation: operation.into(),
            ..Self::default()
        }
    }
}

/// A directory to recreate, with its source mode.
struct DirSpec {
    path: PathBuf,
    mode: u32,
}

/// One file (or symlink) to replicate.
struct FileJob {
    src: PathBuf,
    dst: PathBuf,
}

/// Paths excluded from cache entries, per artifact.
///
/// `rel` is the source-relative path with `/` separators; directories carry a
/// trailing `/`. A skipped directory is not descended into.
fn is_skipped(artifact: &str, rel: &str) -> bool {
    match artifact {
        "cargo" => {
            // Object files and dep-info are cheap to regenerate and huge in
            // aggregate; incremental state is machine-specific; .cargo-lock
            // is a build-in-progress marker, not a lockfile.
            rel.ends_with(".o")
                || rel.ends_with(".d")
                || rel.starts_with("incremental/")
                || rel.contains("/incremental/")
                || rel == ".cargo-lock"
        }
        _ => false,
    }
}

fn walk_error(e: walkdir::Error) -> Error {
    let path = e.path().map(Path::to_path_buf);
    let source = e
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
    Error::Io {
        source,
        path: path.map(PathBuf::into_boxed_path),
        operation: "walk".into(),
    }
}

/// Walk phase: collect directories in pre-order and files in lexical order,
/// applying the artifact's skip rules.
fn walk_tree(src: &Path, dst: &Path, artifact: &str) -> Result<(Vec<DirSpec>, Vec<FileJob>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    let src_owned = src.to_path_buf();
    let artifact_owned = artifact.to_string();
    let walker = WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            let Ok(rel) = entry.path().strip_prefix(&src_owned) else {
                return true;
            };
            if rel.as_os_str().is_empty() {
                return true;
            }
            let mut rel = rel.to_string_lossy().into_owned();
            if entry.file_type().is_dir() {
                rel.push('/');
            }
            !is_skipped(&artifact_owned, &rel)
        });

    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .unwrap_or_else(|_| Path::new(""));
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };
        if entry.file_type().is_dir() {
            let meta = entry.metadata().map_err(walk_error)?;
            dirs.push(DirSpec {
                path: target,
                mode: meta.permissions().mode(),
            });
        } else {
            files.push(FileJob {
                src: entry.into_path(),
                dst: target,
            });
        }
    }

    Ok((dirs, files))
}

/// Replicate `src` into `dst` with a parallel worker pool.
///
/// Directories are created (with their source modes) before any file beneath
/// them. Files are consumed in walk order; completion order is unspecified.
/// The first error wins: remaining workers drain out via a shared
/// cancellation token, which the progress watchdog also trips when no file
/// has completed for [`SeedOptions::progress_timeout`].
///
/// Returns the number of files replicated.
///
/// # Errors
///
/// Surfaces the first per-file error, [`Error::FileTimeout`] for an abandoned
/// file wait, or [`Error::NoProgress`] when the watchdog fired.
pub async fn seed_tree(src: &Path, dst: &Path, opts: SeedOptions) -> Result<u64> {
    let started = Instant::now();

    let (dirs, files) = {
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        let artifact = opts.artifact.clone();
        tokio::task::spawn_blocking(move || walk_tree(&src, &dst, &artifact))
            .await
            .map_err(|e| Error::Io {
                source: std::io::Error::other(e.to_string()),
                path: None,
                operation: "walk".into(),
            })??
    };

    for dir in &dirs {
        fs::create_dir_all(&dir.path).map_err(|e| Error::io(e, &dir.path, "mkdir"))?;
        fs::set_permissions(&dir.path, fs::Permissions::from_mode(dir.mode))
            .map_err(|e| Error::io(e, &dir.path, "chmod"))?;
    }

    let total = files.len() as u64;
    if files.is_empty() {
        return Ok(0);
    }

    let token = CancellationToken::new();
    let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let completed = Arc::new(AtomicU64::new(0));
    // Milliseconds since `started` at which the last file completed.
    let last_progress = Arc::new(AtomicU64::new(0));

    let (tx, rx) = mpsc::channel::<FileJob>(QUEUE_DEPTH);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let feeder = {
        let token = token.clone();
        tokio::spawn(async move {
            for job in files {
                tokio::select! {
                    () = token.cancelled() => break,
                    sent = tx.send(job) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let watchdog = {
        let token = token.clone();
        let first_error = Arc::clone(&first_error);
        let last_progress = Arc::clone(&last_progress);
        let operation = opts.operation.clone();
        let progress_timeout = opts.progress_timeout;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCHDOG_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = tick.tick() => {
                        let last = Duration::from_millis(last_progress.load(Ordering::Relaxed));
                        if started.elapsed().saturating_sub(last) > progress_timeout {
                            record_first(&first_error, Error::NoProgress {
                                operation: operation.clone(),
                                timeout: progress_timeout,
                            });
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut workers = JoinSet::new();
    for _ in 0..opts.workers.clamp(1, files_hint(total)) {
        let token = token.clone();
        let first_error = Arc::clone(&first_error);
        let completed = Arc::clone(&completed);
        let last_progress = Arc::clone(&last_progress);
        let rx = Arc::clone(&rx);
        let operation = opts.operation.clone();
        let file_timeout = opts.file_timeout;
        workers.spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                let job = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        () = token.cancelled() => None,
                        job = rx.recv() => job,
                    }
                };
                let Some(job) = job else { break };
                match replicate_file(job, file_timeout, &operation).await {
                    Ok(()) => {
                        completed.fetch_add(1, Ordering::Relaxed);
                        last_progress
                            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        record_first(&first_error, e);
                        token.cancel();
                        break;
                    }
                }
            }
        });
    }

    while workers.join_next().await.is_some() {}
    token.cancel();
    let _ = feeder.await;
    let _ = watchdog.await;

    if let Some(err) = first_error.lock().ok().and_then(|mut slot| slot.take()) {
        return Err(err);
    }

    let replicated = completed.load(Ordering::Relaxed);
    tracing::debug!(
        files = replicated,
        total,
        elapsed_ms = started.elapsed().as_millis() as u64,
        src = %src.display(),
        dst = %dst.display(),
        "Finished {}",
        opts.operation,
    );
    Ok(replicated)
}

/// Cap the worker count at the number of files, but never below one.
fn files_hint(total: u64) -> usize {
    usize::try_from(total).unwrap_or(usize::MAX).max(1)
}

fn record_first(slot: &Arc<Mutex<Option<Error>>>, err: Error) {
    if let Ok(mut slot) = slot.lock() {
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// Run one file replication on the blocking pool, waiting at most
/// `file_timeout`. An expired wait abandons the task (accepted leakage).
async fn replicate_file(job: FileJob, file_timeout: Duration, operation: &str) -> Result<()> {
    let reported = job.src.clone();
    let work = tokio::task::spawn_blocking(move || link_or_copy(&job.src, &job.dst));
    match tokio::time::timeout(file_timeout, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(Error::Io {
            source: std::io::Error::other(join.to_string()),
            path: Some(reported.into_boxed_path()),
            operation: "replicate".into(),
        }),
        Err(_) => Err(Error::FileTimeout {
            path: reported,
            timeout: file_timeout,
            operation: operation.to_string(),
        }),
    }
}

/// Replicate a single directory entry.
///
/// Symlinks are recreated with their literal target string; regular files
/// are hardlinked with a byte-copy fallback for cross-device and
/// unsupported-operation errors. An already-existing destination counts as
/// success so that concurrent replications into the same tree converge.
pub(crate) fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).map_err(|e| Error::io(e, src, "lstat"))?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).map_err(|e| Error::io(e, src, "readlink"))?;
        return match std::os::unix::fs::symlink(&target, dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::io(e, dst, "symlink")),
        };
    }

    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) if is_hardlink_unsupported(&e) => {
            fs::copy(src, dst).map_err(|e| Error::io(e, dst, "copy"))?;
            Ok(())
        }
        Err(e) => Err(Error::io(e, dst, "hardlink")),
    }
}

/// Whether a failed `link(2)` should fall back to a byte copy.
fn is_hardlink_unsupported(e: &std::io::Error) -> bool {
    if matches!(e.kind(), ErrorKind::CrossesDevices | ErrorKind::Unsupported) {
        return true;
    }
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EXDEV) {
        return true;
    }
    // Last resort for platforms that surface neither a kind nor a code.
    let message = e.to_string();
    message.contains("cross-device") || message.contains("not supported")
}

/// Replicate `src` into `dst` single-threaded, without skip rules, progress
/// tracking or timeouts.
///
/// Per-entry semantics match [`seed_tree`]: hardlink with copy fallback,
/// symlinks recreated verbatim. Returns the number of files replicated.
///
/// # Errors
///
/// Fails on the first I/O error encountered.
pub fn hardlink_tree(src: &Path, dst: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(src).map_err(|e| Error::io(e, src, "lstat"))?;
    fs::create_dir_all(dst).map_err(|e| Error::io(e, dst, "mkdir"))?;
    fs::set_permissions(dst, meta.permissions()).map_err(|e| Error::io(e, dst, "chmod"))?;

    let mut count = 0;
    let entries = fs::read_dir(src).map_err(|e| Error::io(e, src, "read_dir"))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(e, src, "read_dir"))?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::io(e, &path, "stat"))?;
        if file_type.is_dir() {
            count += hardlink_tree(&path, &target)?;
        } else {
            link_or_copy(&path, &target)?;
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn cargo_skip_rules() {
        assert!(is_skipped("cargo", "debug/foo.o"));
        assert!(is_skipped("cargo", "debug/deps/lib.d"));
        assert!(is_skipped("cargo", "incremental/"));
        assert!(is_skipped("cargo", "debug/incremental/app-1a2b/"));
        assert!(is_skipped("cargo", ".cargo-lock"));
        assert!(!is_skipped("cargo", "debug/app"));
        assert!(!is_skipped("cargo", "debug/libapp.rlib"));
        // Other artifacts have no rules.
        assert!(!is_skipped("npm", "foo.o"));
    }

    #[test]
    fn hardlink_tree_shares_inodes() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("debug/app.rlib"), "X");
        write(&src.join("top.txt"), "Y");

        let count = hardlink_tree(&src, &dst).unwrap();
        assert_eq!(count, 2);

        let src_ino = fs::metadata(src.join("debug/app.rlib")).unwrap().ino();
        let dst_ino = fs::metadata(dst.join("debug/app.rlib")).unwrap().ino();
        assert_eq!(src_ino, dst_ino);
    }

    #[test]
    fn hardlink_tree_recreates_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("real/f"), "content");
        std::os::unix::fs::symlink("../real", src.join("link")).unwrap();

        hardlink_tree(&src, &dst).unwrap();

        let target = fs::read_link(dst.join("link")).unwrap();
        assert_eq!(target, Path::new("../real"));
        assert!(dst.join("real/f").exists());
    }

    #[test]
    fn hardlink_tree_tolerates_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("a"), "A");

        hardlink_tree(&src, &dst).unwrap();
        // Second run over the same destination is a no-op, not an error.
        hardlink_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a")).unwrap(), "A");
    }

    #[tokio::test]
    async fn seed_tree_replicates_and_links() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("debug/deps/libapp.rlib"), "rlib");
        write(&src.join("debug/app"), "bin");

        let count = seed_tree(&src, &dst, SeedOptions::default()).await.unwrap();
        assert_eq!(count, 2);

        let src_ino = fs::metadata(src.join("debug/app")).unwrap().ino();
        let dst_ino = fs::metadata(dst.join("debug/app")).unwrap().ino();
        assert_eq!(src_ino, dst_ino);
    }

    #[tokio::test]
    async fn seed_tree_applies_cargo_skip_rules() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("a.o"), "obj");
        write(&src.join("b.d"), "dep");
        write(&src.join("incremental/c.rmeta"), "meta");
        write(&src.join("good.rlib"), "keep");
        write(&src.join(".cargo-lock"), "");

        seed_tree(&src, &dst, SeedOptions::for_artifact("cargo", "seeding"))
            .await
            .unwrap();

        assert!(dst.join("good.rlib").exists());
        assert!(!dst.join("a.o").exists());
        assert!(!dst.join("b.d").exists());
        assert!(!dst.join("incremental").exists());
        assert!(!dst.join(".cargo-lock").exists());
    }

    #[tokio::test]
    async fn seed_tree_preserves_symlink_targets() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("real/f"), "content");
        std::os::unix::fs::symlink("../real", src.join("link")).unwrap();
        std::os::unix::fs::symlink("/nowhere/at/all", src.join("dangling")).unwrap();

        seed_tree(&src, &dst, SeedOptions::default()).await.unwrap();

        assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("../real"));
        assert_eq!(
            fs::read_link(dst.join("dangling")).unwrap(),
            Path::new("/nowhere/at/all")
        );
        let src_ino = fs::metadata(src.join("real/f")).unwrap().ino();
        let dst_ino = fs::metadata(dst.join("real/f")).unwrap().ino();
        assert_eq!(src_ino, dst_ino);
    }

    #[tokio::test]
    async fn seed_tree_preserves_directory_modes() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("sub/f"), "x");
        fs::set_permissions(src.join("sub"), fs::Permissions::from_mode(0o700)).unwrap();

        seed_tree(&src, &dst, SeedOptions::default()).await.unwrap();

        let mode = fs::metadata(dst.join("sub")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn seed_tree_of_empty_tree_is_ok() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();

        let count = seed_tree(&src, &dst, SeedOptions::default()).await.unwrap();
        assert_eq!(count, 0);
        assert!(dst.is_dir());
    }
}
