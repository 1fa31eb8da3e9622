//! Error types for cache operations

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for cache operations
///
/// Lock contention is deliberately absent: a held advisory lock means another
/// process owns the guarded operation, and callers see `Ok(None)` from
/// [`crate::lock::EntryLock::try_acquire`] rather than an error.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(mono::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "hardlink")
        operation: String,
    },

    /// A fingerprint key-command exited non-zero or could not be run
    #[error("key command `{command}` failed: {detail}")]
    #[diagnostic(
        code(mono::cache::key_command),
        help("Key commands run with the workspace's ambient environment; check the command works there")
    )]
    KeyCommand {
        /// The command text as configured
        command: String,
        /// Exit status or spawn failure description
        detail: String,
    },

    /// An in-flight build marker was found inside an artifact tree
    #[error("build in progress for {artifact}: {} exists", marker.display())]
    #[diagnostic(
        code(mono::cache::build_in_progress),
        help("Wait for the running build to finish, then retry")
    )]
    BuildInProgress {
        /// Artifact whose tree carries the marker
        artifact: String,
        /// The marker file that was found
        marker: PathBuf,
    },

    /// A single file operation exceeded its timeout
    #[error("timed out after {timeout:?} {operation} {}", path.display())]
    #[diagnostic(code(mono::cache::file_timeout))]
    FileTimeout {
        /// File being replicated when the timeout fired
        path: PathBuf,
        /// The configured per-file timeout
        timeout: Duration,
        /// Operation name, e.g. "restoring" or "seeding"
        operation: String,
    },

    /// The replicator made no progress for longer than the watchdog allows
    #[error("no progress for {timeout:?} while {operation}")]
    #[diagnostic(
        code(mono::cache::no_progress),
        help("The filesystem may be contended or hung; the operation was aborted")
    )]
    NoProgress {
        /// Operation name, e.g. "restoring" or "seeding"
        operation: String,
        /// The configured no-progress timeout
        timeout: Duration,
    },

    /// Both a sync operation and its rollback failed
    #[error("cache sync failed and recovery also failed; cache and workspace may both be partial")]
    #[diagnostic(
        code(mono::cache::recovery),
        help("Inspect both errors; the workspace tree and the cache entry each need manual review")
    )]
    Recovery {
        /// The failure that triggered the rollback
        #[source]
        primary: Box<Error>,
        /// The failure of the rollback itself
        recovery: Box<Error>,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a key-command failure from an exit status
    #[must_use]
    pub fn key_command(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::KeyCommand {
            command: command.into(),
            detail: detail.into(),
        }
    }
}

impl From<mono_core::Error> for Error {
    fn from(err: mono_core::Error) -> Self {
        match err {
            mono_core::Error::Io {
                source,
                path,
                operation,
            } => Self::Io {
                source,
                path,
                operation,
            },
            mono_core::Error::Configuration { message } => Self::Io {
                source: std::io::Error::other(message),
                path: None,
                operation: "configure".into(),
            },
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
