//! Content-addressed, hardlink-shared build artifact cache for mono
//!
//! Sibling workspaces with identical dependency manifests share one build of
//! `target/`, `node_modules/` and friends. An artifact's declared inputs
//! (lockfiles, toolchain versions) hash into a 16-hex cache key; the built
//! tree lives once under `~/.mono/cache_local/` and materializes into each
//! workspace as hardlinks, so a second workspace appears in seconds.
//!
//! # Overview
//!
//! - [`fingerprint`]: cache-key computation from key-files and key-commands
//! - [`replicate`]: parallel hardlink/copy tree replication with timeouts,
//!   a no-progress watchdog and artifact-specific skip rules
//! - [`store`]: the [`CacheManager`] operations (prepare, restore, store,
//!   sync, seed) over the three-layer on-disk layout
//! - [`fixes`]: toolchain-specific post-restore repairs
//! - [`lock`]: advisory per-entry locks serializing cross-process mutation
//! - [`conflicts`]: build-in-progress markers and the advisory process scan
//! - [`inventory`]: enumeration, size accounting and eviction
//! - [`env`]: shared compiler-cache environment for build scripts
//!
//! # Concurrency
//!
//! Operations are safe to run concurrently across processes: mutation of one
//! cache entry is serialized by a non-blocking advisory lock on its `.lock`
//! sidecar, losers skip silently, and readers tolerate concurrent mutation
//! because entries appear via atomic rename and vanish whole. Within one
//! process, replication fans out to a worker pool guarded by per-file
//! timeouts and a no-progress watchdog; an abandoned per-file wait leaves
//! its I/O task running in the background by design.

pub mod conflicts;
pub mod env;
mod error;
pub mod fingerprint;
pub mod fixes;
pub mod inventory;
pub mod lock;
pub mod replicate;
pub mod store;

pub use conflicts::{BuildProcess, build_in_progress, check_build_conflicts};
pub use error::{Error, Result};
pub use fingerprint::compute_cache_key;
pub use inventory::CacheEntryInfo;
pub use lock::EntryLock;
pub use replicate::{SeedOptions, hardlink_tree, seed_tree};
pub use store::{CacheEntry, CacheManager, SyncOptions};
