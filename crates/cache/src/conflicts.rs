//! Build-conflict detection
//!
//! Two independent signals guard destructive cache operations:
//!
//! - An artifact-keyed marker file inside the build tree means a build is in
//!   flight right now; operations that would move or delete the tree refuse
//!   to run.
//! - A best-effort scan of running processes finds builds touching the
//!   project, so the orchestrator can warn the user before destructive
//!   operations. The scan never fails a cache operation: any enumeration
//!   problem reads as "no conflicts detected".

use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

/// A running process that looks like a build over the project.
#[derive(Debug, Clone)]
pub struct BuildProcess {
    /// Process id.
    pub pid: u32,
    /// Full command line.
    pub command: String,
}

/// The build-in-progress marker file for an artifact, relative to the
/// workspace, if the toolchain has one.
#[must_use]
pub fn build_marker(artifact: &str, workspace: &Path) -> Option<PathBuf> {
    match artifact {
        "cargo" => Some(workspace.join("target").join(".cargo-lock")),
        _ => None,
    }
}

/// Check whether an in-flight build marker exists for `artifact` in
/// `workspace`, returning the marker path when it does.
#[must_use]
pub fn build_in_progress(artifact: &str, workspace: &Path) -> Option<PathBuf> {
    build_marker(artifact, workspace).filter(|marker| marker.exists())
}

/// Command substrings that identify build processes.
const BUILD_COMMANDS: &[&str] = &["cargo", "rustc"];

/// Scan running processes for builds whose command line mentions both a
/// known build tool and the given project path.
///
/// Best-effort and advisory: enumeration failures yield an empty list.
#[must_use]
pub fn check_build_conflicts(project_root: &Path) -> Vec<BuildProcess> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(sysinfo::UpdateKind::Always),
    );

    let root = project_root.to_string_lossy();
    let mut conflicts = Vec::new();
    for (pid, process) in system.processes() {
        let command = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if command.contains(root.as_ref())
            && BUILD_COMMANDS.iter().any(|tool| command.contains(tool))
        {
            conflicts.push(BuildProcess {
                pid: pid.as_u32(),
                command,
            });
        }
    }
    if !conflicts.is_empty() {
        tracing::warn!(
            count = conflicts.len(),
            project = %project_root.display(),
            "Found running builds over the project"
        );
    }
    conflicts
}
