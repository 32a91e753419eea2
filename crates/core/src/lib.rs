//! stagesync-core: Staged directory sync engine
//!
//! Provides manifest construction, tree diffing, the remote transport trait,
//! and the per-host sync executor.

pub mod build;
pub mod compose;
pub mod config;
pub mod diff;
pub mod hash;
pub mod manifest;
pub mod remote;
pub mod retry;
pub mod sync;
pub mod template;

pub use config::{ConfigError, DeployConfig, HostSettings, PartialConfig, SshHostConfig, Target};
pub use diff::{DiffKind, DiffOp, SyncPlan, diff};
pub use hash::ContentDigest;
pub use manifest::{MANIFEST_FILE, ManifestEntry, ManifestError, build_manifest};
pub use remote::{CommandOutput, RemoteCommandError, Transport};
pub use sync::{
    RestartPlan, SyncAction, SyncContext, SyncExecutor, SyncMode, SyncPhase, SyncReport,
    SyncReporter, TracingReporter,
};
