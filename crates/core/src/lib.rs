//! Paths, identity and configuration for the mono cache engine
//!
//! This crate holds the pieces every other mono crate agrees on:
//!
//! - The on-disk layout under `~/.mono` and the project-identity scheme
//!   ([`paths`])
//! - The `build:` configuration schema and lockfile-based artifact
//!   auto-detection ([`config`])
//! - The shared error/result types ([`Error`], [`Result`])

pub mod config;
mod error;
pub mod paths;

pub use config::{ArtifactSpec, BuildConfig, BuildStrategy, CacheLimits, detect_artifacts};
pub use error::{Error, Result};
pub use paths::{
    artifact_cache_path, global_cache_dir, home_dir, local_cache_dir, project_cache_dir,
    project_id,
};
