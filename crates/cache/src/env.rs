//! Compiler-cache environment contribution
//!
//! Build scripts run with these variables so every workspace shares the
//! download and compiler caches under `cache_global/`, regardless of whether
//! the artifact cache itself hits.

use crate::store::CacheManager;
use mono_core::{BuildConfig, BuildStrategy};
use std::collections::BTreeMap;
use std::path::Path;

impl CacheManager {
    /// Environment variables for a build under `config`.
    ///
    /// The `none` strategy contributes nothing. Every other strategy points
    /// the package managers at the shared `cache_global` subdirectories and,
    /// when the configuration permits and an `sccache` binary is on `PATH`,
    /// routes rustc through it.
    #[must_use]
    pub fn build_env_vars(&self, config: &BuildConfig) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if config.strategy == BuildStrategy::None {
            return vars;
        }

        let global = self.global_cache_dir();
        vars.insert(
            "CARGO_HOME".into(),
            global.join("cargo").to_string_lossy().into_owned(),
        );
        vars.insert(
            "npm_config_cache".into(),
            global.join("npm").to_string_lossy().into_owned(),
        );
        vars.insert(
            "YARN_CACHE_FOLDER".into(),
            global.join("yarn").to_string_lossy().into_owned(),
        );
        vars.insert(
            "PNPM_HOME".into(),
            global.join("pnpm").to_string_lossy().into_owned(),
        );

        if config.sccache.unwrap_or(true) && sccache_on_path() {
            vars.insert("RUSTC_WRAPPER".into(), "sccache".into());
            vars.insert(
                "SCCACHE_DIR".into(),
                global.join("sccache").to_string_lossy().into_owned(),
            );
        }
        vars
    }
}

/// Whether an `sccache` binary is reachable through `PATH`.
fn sccache_on_path() -> bool {
    std::env::var_os("PATH")
        .map(|path| {
            std::env::split_paths(&path).any(|dir| is_executable(&dir.join("sccache")))
        })
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn none_strategy_contributes_nothing() {
        let tmp = TempDir::new().unwrap();
        let manager = CacheManager::with_home(tmp.path());
        let config = BuildConfig {
            strategy: BuildStrategy::None,
            ..BuildConfig::default()
        };
        assert!(manager.build_env_vars(&config).is_empty());
    }

    #[test]
    fn caches_point_into_cache_global() {
        let tmp = TempDir::new().unwrap();
        let manager = CacheManager::with_home(tmp.path());
        let vars = manager.build_env_vars(&BuildConfig::default());

        let global = tmp.path().join("cache_global");
        assert_eq!(
            vars.get("CARGO_HOME").map(String::as_str),
            global.join("cargo").to_str()
        );
        assert_eq!(
            vars.get("npm_config_cache").map(String::as_str),
            global.join("npm").to_str()
        );
        assert_eq!(
            vars.get("YARN_CACHE_FOLDER").map(String::as_str),
            global.join("yarn").to_str()
        );
        assert_eq!(
            vars.get("PNPM_HOME").map(String::as_str),
            global.join("pnpm").to_str()
        );
    }

    #[test]
    fn sccache_disabled_by_configuration() {
        let tmp = TempDir::new().unwrap();
        let manager = CacheManager::with_home(tmp.path());
        let config = BuildConfig {
            sccache: Some(false),
            ..BuildConfig::default()
        };
        let vars = manager.build_env_vars(&config);
        assert!(!vars.contains_key("RUSTC_WRAPPER"));
        assert!(!vars.contains_key("SCCACHE_DIR"));
    }
}
