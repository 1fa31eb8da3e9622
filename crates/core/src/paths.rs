//! Cache layout and project identity
//!
//! All cached state lives under a single home directory:
//!
//! ```text
//! ~/.mono/
//!   cache_global/          # shared download/compiler caches (cargo, npm, ...)
//!   cache_local/
//!     <project_id>/        # 12-hex prefix of SHA-256 over the project root path
//!       <artifact>/
//!         <cache_key>/     # entry root, one child per materialized path
//!         <cache_key>.lock # sidecar advisory lock
//! ```
//!
//! Paths here are plain string joins. No canonicalization or symlink
//! resolution is performed; the caller decides which root path identifies a
//! project.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Environment variable overriding the mono home directory.
pub const HOME_ENV: &str = "MONO_HOME";

/// Number of hex characters in a project identifier.
pub const PROJECT_ID_LEN: usize = 12;

/// Resolve the mono home directory.
///
/// Honors `MONO_HOME` when set and non-empty, otherwise `<user home>/.mono`.
///
/// # Errors
///
/// Returns an error if the override is unset and the user home directory
/// cannot be resolved.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|s| !s.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".mono"))
        .ok_or_else(|| Error::configuration("Failed to resolve the user home directory"))
}

/// The shared download/compiler cache directory under `home`.
#[must_use]
pub fn global_cache_dir(home: &Path) -> PathBuf {
    home.join("cache_global")
}

/// The per-project artifact cache directory under `home`.
#[must_use]
pub fn local_cache_dir(home: &Path) -> PathBuf {
    home.join("cache_local")
}

/// Derive the project identifier for a project root path.
///
/// The identifier is the first 12 hex characters of the SHA-256 digest of the
/// path string. Deterministic, no I/O; collisions are ignored because the
/// path space is small in practice.
#[must_use]
pub fn project_id(root: &Path) -> String {
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(PROJECT_ID_LEN);
    id
}

/// The cache directory holding all artifacts of one project.
#[must_use]
pub fn project_cache_dir(home: &Path, root: &Path) -> PathBuf {
    local_cache_dir(home).join(project_id(root))
}

/// The cache entry path for one `(project, artifact, key)` triple.
#[must_use]
pub fn artifact_cache_path(home: &Path, root: &Path, artifact: &str, key: &str) -> PathBuf {
    project_cache_dir(home, root).join(artifact).join(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_deterministic() {
        let a = project_id(Path::new("/home/user/projects/app"));
        let b = project_id(Path::new("/home/user/projects/app"));
        assert_eq!(a, b);
        assert_eq!(a.len(), PROJECT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn project_id_differs_per_root() {
        let a = project_id(Path::new("/home/user/projects/app"));
        let b = project_id(Path::new("/home/user/projects/other"));
        assert_ne!(a, b);
    }

    #[test]
    fn artifact_cache_path_is_pure() {
        let home = Path::new("/tmp/mono-home");
        let root = Path::new("/p");
        let first = artifact_cache_path(home, root, "cargo", "0123456789abcdef");
        let second = artifact_cache_path(home, root, "cargo", "0123456789abcdef");
        assert_eq!(first, second);
        assert!(first.starts_with(home.join("cache_local")));
        assert!(first.ends_with(format!("{}/cargo/0123456789abcdef", project_id(root))));
    }

    #[test]
    fn layout_directories_hang_off_home() {
        let home = Path::new("/tmp/mono-home");
        assert_eq!(global_cache_dir(home), home.join("cache_global"));
        assert_eq!(local_cache_dir(home), home.join("cache_local"));
    }
}
