//! Artifact fingerprinting
//!
//! A cache key summarizes an artifact's declared inputs: the bytes of each
//! key-file and the stdout of each key-command, hashed in list order into one
//! SHA-256 digest. The first 16 hex characters form the key.
//!
//! Missing key-files contribute nothing and are not an error, which lets
//! descriptors list optional manifests (`rust-toolchain.toml`, `.npmrc`)
//! without forcing every workspace to carry them.

use crate::{Error, Result};
use mono_core::ArtifactSpec;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::Command;

/// Number of hex characters in a cache key.
pub const CACHE_KEY_LEN: usize = 16;

/// Compute the cache key for `artifact` as materialized in `workspace`.
///
/// Key-commands run through `sh -c` with the workspace as working directory
/// and the ambient process environment. Their stderr is ignored; stdout feeds
/// the digest.
///
/// # Errors
///
/// Fails if a key-file exists but cannot be read, if a key-command cannot be
/// spawned, or if a key-command exits non-zero.
pub fn compute_cache_key(artifact: &ArtifactSpec, workspace: &Path) -> Result<String> {
    let mut hasher = Sha256::new();

    for key_file in &artifact.key_files {
        let path = workspace.join(key_file);
        match File::open(&path) {
            Ok(file) => hash_reader(&mut hasher, file, &path)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(
                    artifact = %artifact.name,
                    key_file,
                    "Key file absent, skipping"
                );
            }
            Err(e) => return Err(Error::io(e, &path, "open")),
        }
    }

    for key_command in &artifact.key_commands {
        let output = Command::new("sh")
            .arg("-c")
            .arg(key_command)
            .current_dir(workspace)
            .output()
            .map_err(|e| Error::key_command(key_command, format!("failed to spawn: {e}")))?;
        if !output.status.success() {
            return Err(Error::key_command(
                key_command,
                format!("exited with {}", output.status),
            ));
        }
        hasher.update(&output.stdout);
    }

    let mut key = hex::encode(hasher.finalize());
    key.truncate(CACHE_KEY_LEN);
    Ok(key)
}

fn hash_reader(hasher: &mut Sha256, mut reader: impl Read, path: &Path) -> Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(key_files: &[&str], key_commands: &[&str]) -> ArtifactSpec {
        ArtifactSpec {
            name: "cargo".into(),
            key_files: key_files.iter().map(|s| (*s).to_string()).collect(),
            key_commands: key_commands.iter().map(|s| (*s).to_string()).collect(),
            paths: vec!["target".into()],
        }
    }

    #[test]
    fn empty_inputs_hash_the_empty_string() {
        let tmp = TempDir::new().unwrap();
        let key = compute_cache_key(&artifact(&[], &[]), tmp.path()).unwrap();
        // SHA-256 of no input, truncated.
        assert_eq!(key, "e3b0c44298fc1c14");
    }

    #[test]
    fn key_tracks_file_content() {
        let tmp = TempDir::new().unwrap();
        let spec = artifact(&["Cargo.lock"], &[]);

        std::fs::write(tmp.path().join("Cargo.lock"), "A").unwrap();
        let key_a = compute_cache_key(&spec, tmp.path()).unwrap();

        std::fs::write(tmp.path().join("Cargo.lock"), "B").unwrap();
        let key_b = compute_cache_key(&spec, tmp.path()).unwrap();

        assert_ne!(key_a, key_b);
        assert_eq!(key_a.len(), CACHE_KEY_LEN);

        std::fs::write(tmp.path().join("Cargo.lock"), "A").unwrap();
        assert_eq!(compute_cache_key(&spec, tmp.path()).unwrap(), key_a);
    }

    #[test]
    fn missing_key_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Cargo.lock"), "A").unwrap();

        let with_optional = artifact(&["Cargo.lock", "rust-toolchain.toml"], &[]);
        let without = artifact(&["Cargo.lock"], &[]);
        assert_eq!(
            compute_cache_key(&with_optional, tmp.path()).unwrap(),
            compute_cache_key(&without, tmp.path()).unwrap()
        );
    }

    #[test]
    fn command_stdout_feeds_the_key() {
        let tmp = TempDir::new().unwrap();
        let key_a = compute_cache_key(&artifact(&[], &["echo 1.80.0"]), tmp.path()).unwrap();
        let key_b = compute_cache_key(&artifact(&[], &["echo 1.81.0"]), tmp.path()).unwrap();
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn command_stderr_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let quiet = compute_cache_key(&artifact(&[], &["echo out"]), tmp.path()).unwrap();
        let noisy =
            compute_cache_key(&artifact(&[], &["echo noise >&2; echo out"]), tmp.path()).unwrap();
        assert_eq!(quiet, noisy);
    }

    #[test]
    fn failing_command_is_a_hard_error() {
        let tmp = TempDir::new().unwrap();
        let err = compute_cache_key(&artifact(&[], &["exit 3"]), tmp.path()).unwrap_err();
        match err {
            Error::KeyCommand { command, detail } => {
                assert_eq!(command, "exit 3");
                assert!(detail.contains("exit"), "detail: {detail}");
            }
            other => panic!("expected KeyCommand, got {other:?}"),
        }
    }

    #[test]
    fn command_output_is_byte_exact() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Cargo.lock"), "X").unwrap();
        // Two commands producing the same bytes contribute the same key.
        let via_echo = compute_cache_key(&artifact(&["Cargo.lock"], &["echo Y"]), tmp.path());
        let via_printf =
            compute_cache_key(&artifact(&["Cargo.lock"], &["printf 'Y\\n'"]), tmp.path());
        assert_eq!(via_echo.unwrap(), via_printf.unwrap());
    }
}
