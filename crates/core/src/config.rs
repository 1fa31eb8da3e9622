//! Build configuration schema
//!
//! The outer tool carries a per-project YAML file; the `build:` section of
//! that file is the part the cache engine consumes. Artifact descriptors can
//! be listed explicitly or auto-detected from well-known lockfiles.
//!
//! ```yaml
//! build:
//!   strategy: layered
//!   download_cache: true
//!   artifacts:
//!     - name: cargo
//!       key_files: [Cargo.lock]
//!       key_commands: ["rustc --version"]
//!       paths: [target]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

/// How build artifacts are provisioned for a new workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStrategy {
    /// Restore from the local artifact cache, building on miss.
    #[default]
    Layered,
    /// Always build, but share compiler/download caches.
    Compile,
    /// Only share download caches.
    Download,
    /// No caching at all.
    None,
}

/// One cacheable artifact: a named subtree derived from dependency manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Artifact name, e.g. `cargo` or `npm`.
    pub name: String,
    /// Workspace-relative files whose contents feed the cache key.
    #[serde(default)]
    pub key_files: Vec<String>,
    /// Shell commands whose stdout feeds the cache key.
    #[serde(default)]
    pub key_commands: Vec<String>,
    /// Workspace-relative roots whose contents are cached.
    pub paths: Vec<String>,
}

/// Limits consumed by an external eviction policy, not by the engine itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Maximum total cache size, e.g. `"20GB"`.
    #[serde(default)]
    pub max_size: Option<String>,
    /// Maximum entry age, e.g. `"30d"`.
    #[serde(default)]
    pub max_age: Option<String>,
    /// Whether the outer tool cleans automatically.
    #[serde(default)]
    pub auto_clean: bool,
}

/// The `build:` section of the project configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Provisioning strategy, defaults to `layered`.
    #[serde(default)]
    pub strategy: BuildStrategy,
    /// Whether download caches are shared, defaults to true.
    #[serde(default = "default_true")]
    pub download_cache: bool,
    /// Whether sccache is used as the rustc wrapper. `None` auto-detects.
    #[serde(default)]
    pub sccache: Option<bool>,
    /// Explicit artifact list. Empty means auto-detect from lockfiles.
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    /// Eviction limits, consumed by the outer tool.
    #[serde(default)]
    pub cache: CacheLimits,
}

const fn default_true() -> bool {
    true
}

impl BuildConfig {
    /// The artifacts to cache for `workspace`: the configured list, or the
    /// auto-detected one when the configuration names none.
    #[must_use]
    pub fn effective_artifacts(&self, workspace: &Path) -> Vec<ArtifactSpec> {
        if self.artifacts.is_empty() {
            detect_artifacts(workspace)
        } else {
            self.artifacts.clone()
        }
    }
}

/// Lockfile probes for artifact auto-detection, in detection order.
const LOCKFILE_PROBES: &[(&str, &str, &str, &str)] = &[
    ("Cargo.lock", "cargo", "rustc --version", "target"),
    ("package-lock.json", "npm", "node --version", "node_modules"),
    ("yarn.lock", "yarn", "node --version", "node_modules"),
    ("pnpm-lock.yaml", "pnpm", "node --version", "node_modules"),
];

/// Detect cacheable artifacts by probing `workspace` for known lockfiles.
///
/// Each detected artifact keys on the lockfile contents plus the toolchain
/// version, so a toolchain upgrade invalidates the cache the same way a
/// dependency bump does.
#[must_use]
pub fn detect_artifacts(workspace: &Path) -> Vec<ArtifactSpec> {
    let mut artifacts = Vec::new();
    for (lockfile, name, version_command, path) in LOCKFILE_PROBES {
        if workspace.join(lockfile).is_file() {
            tracing::debug!(artifact = name, lockfile, "Detected cacheable artifact");
            artifacts.push(ArtifactSpec {
                name: (*name).to_string(),
                key_files: vec![(*lockfile).to_string()],
                key_commands: vec![(*version_command).to_string()],
                paths: vec![(*path).to_string()],
            });
        }
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_schema() {
        let config: BuildConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.strategy, BuildStrategy::Layered);
        assert!(config.download_cache);
        assert!(config.sccache.is_none());
        assert!(config.artifacts.is_empty());
        assert!(!config.cache.auto_clean);
    }

    #[test]
    fn parses_full_build_section() {
        let yaml = r"
strategy: compile
download_cache: false
sccache: true
artifacts:
  - name: cargo
    key_files: [Cargo.lock, rust-toolchain.toml]
    key_commands: ['rustc --version']
    paths: [target]
cache:
  max_size: 20GB
  auto_clean: true
";
        let config: BuildConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.strategy, BuildStrategy::Compile);
        assert!(!config.download_cache);
        assert_eq!(config.sccache, Some(true));
        assert_eq!(config.artifacts.len(), 1);
        assert_eq!(config.artifacts[0].key_files.len(), 2);
        assert_eq!(config.cache.max_size.as_deref(), Some("20GB"));
        assert!(config.cache.auto_clean);
    }

    #[test]
    fn detects_cargo_from_lockfile() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Cargo.lock"), "# lock").unwrap();

        let artifacts = detect_artifacts(tmp.path());
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "cargo");
        assert_eq!(artifacts[0].paths, vec!["target".to_string()]);
        assert_eq!(artifacts[0].key_commands, vec!["rustc --version".to_string()]);
    }

    #[test]
    fn detects_multiple_toolchains() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Cargo.lock"), "# lock").unwrap();
        std::fs::write(tmp.path().join("pnpm-lock.yaml"), "lockfileVersion: 9").unwrap();

        let names: Vec<String> = detect_artifacts(tmp.path())
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["cargo".to_string(), "pnpm".to_string()]);
    }

    #[test]
    fn explicit_artifacts_win_over_detection() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Cargo.lock"), "# lock").unwrap();

        let config = BuildConfig {
            artifacts: vec![ArtifactSpec {
                name: "custom".into(),
                key_files: vec!["deps.lock".into()],
                key_commands: vec![],
                paths: vec!["out".into()],
            }],
            ..BuildConfig::default()
        };
        let artifacts = config.effective_artifacts(tmp.path());
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "custom");
    }

    #[test]
    fn empty_workspace_detects_nothing() {
        let tmp = TempDir::new().unwrap();
        assert!(detect_artifacts(tmp.path()).is_empty());
    }
}
