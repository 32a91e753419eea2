//! Per-host synchronization of a staged directory
//!
//! ```text
//! Start -> ManifestCheck -> IncrementalSync | FullResync -> PublishManifest -> Restart -> Done
//! ```
//!
//! Any step may fail, which ends the run in `Failed`. The remote manifest is
//! uploaded only after every content change succeeded, so a host whose run was
//! interrupted either keeps its old manifest or has none. In both cases the
//! next run repairs it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use futures::stream::{self, TryStreamExt as _};

use crate::diff::{SyncPlan, diff};
use crate::manifest::ManifestEntry;
use crate::remote::{MAX_CONCURRENT_OPS, Transport, join_remote, shell_quote};

/// Conventional name of the compose file on the remote host
pub const REMOTE_COMPOSE_FILE: &str = "docker-compose.yml";

/// Phase of a per-host sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Start,
    ManifestCheck,
    IncrementalSync,
    FullResync,
    PublishManifest,
    Restart,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::ManifestCheck => "manifest check",
            Self::IncrementalSync => "incremental sync",
            Self::FullResync => "full resync",
            Self::PublishManifest => "publish manifest",
            Self::Restart => "restart",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A remote side effect the executor is about to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Mkdir(String),
    Exec(String),
    ReadManifest(String),
    Upload { local: PathBuf, remote: String },
    Delete(String),
    DeleteSkipped(String),
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mkdir(path) => write!(f, "mkdir -p {path}"),
            Self::Exec(command) => write!(f, "exec {command}"),
            Self::ReadManifest(path) => write!(f, "read manifest {path}"),
            Self::Upload { local, remote } => write!(f, "upload {} -> {remote}", local.display()),
            Self::Delete(path) => write!(f, "delete {path}"),
            Self::DeleteSkipped(path) => write!(f, "delete {path} (already absent)"),
        }
    }
}

/// Receives progress from a sync run
///
/// The executor never writes to the console itself; callers decide where
/// diagnostics go.
pub trait SyncReporter: Send + Sync {
    fn phase(&self, host: &str, phase: SyncPhase);

    fn action(&self, host: &str, action: &SyncAction);
}

/// Reporter that forwards everything to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl SyncReporter for TracingReporter {
    fn phase(&self, host: &str, phase: SyncPhase) {
        tracing::debug!(host, %phase, "phase");
    }

    fn action(&self, host: &str, action: &SyncAction) {
        tracing::info!(host, "{action}");
    }
}

/// Everything one host's sync run needs to know
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// Host identifier used in diagnostics
    pub host: String,
    /// Local staged-content directory
    pub stage_dir: PathBuf,
    /// Local manifest written by the build step
    pub manifest_path: PathBuf,
    /// Remote root holding the compose file, staged directory and manifest
    pub remote_dir: String,
    /// Name of the staged directory under `remote_dir`
    pub stage_name: String,
    /// Name of the manifest file under `remote_dir`
    pub manifest_name: String,
    /// Local compose file uploaded to `remote_dir` before syncing
    pub compose_file: Option<PathBuf>,
}

impl SyncContext {
    #[must_use]
    pub fn remote_stage_dir(&self) -> String {
        join_remote(&self.remote_dir, [&self.stage_name])
    }

    #[must_use]
    pub fn remote_manifest_path(&self) -> String {
        join_remote(&self.remote_dir, [&self.manifest_name])
    }
}

/// How to restart the remote service once the content is in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPlan {
    /// Replaces the default docker-compose one-liner when set
    pub command: Option<String>,
    /// Lines of service log to show after a default restart
    pub log_tail: u32,
    /// Pause before fetching the log tail
    pub log_delay: Duration,
}

impl Default for RestartPlan {
    fn default() -> Self {
        Self {
            command: None,
            log_tail: 100,
            log_delay: Duration::from_secs(5),
        }
    }
}

/// Default restart: rebuild and relaunch the compose project, then prune
#[must_use]
pub fn default_start_command(remote_dir: &str) -> String {
    format!(
        "source ~/.bash_profile; cd {} && docker-compose down && docker-compose build --force-rm && docker-compose up -d && docker system prune -f",
        shell_quote(remote_dir)
    )
}

/// How the staged content reached the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Only the differences against the remote manifest were applied
    Incremental { deleted: usize, uploaded: usize },
    /// No remote manifest: the whole staged directory was uploaded
    Full,
}

/// Outcome of a successful sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub host: String,
    pub mode: SyncMode,
    pub restarted: bool,
}

/// Runs the sync state machine for one host
pub struct SyncExecutor<'a, T: Transport + ?Sized> {
    ctx: &'a SyncContext,
    transport: &'a T,
    restart: Option<RestartPlan>,
    reporter: &'a dyn SyncReporter,
}

impl<'a, T: Transport + ?Sized> SyncExecutor<'a, T> {
    pub fn new(ctx: &'a SyncContext, transport: &'a T, reporter: &'a dyn SyncReporter) -> Self {
        Self {
            ctx,
            transport,
            restart: None,
            reporter,
        }
    }

    /// Restart the service after syncing
    #[must_use]
    pub fn with_restart(mut self, plan: RestartPlan) -> Self {
        self.restart = Some(plan);
        self
    }

    /// Run every phase, reporting `Failed` if any of them errors
    pub async fn run(&self) -> Result<SyncReport> {
        match self.run_phases().await {
            Ok(report) => {
                self.phase(SyncPhase::Done);
                Ok(report)
            }
            Err(err) => {
                self.phase(SyncPhase::Failed);
                Err(err.wrap_err(format!("sync to {} failed", self.ctx.host)))
            }
        }
    }

    async fn run_phases(&self) -> Result<SyncReport> {
        self.phase(SyncPhase::Start);
        self.prepare_remote_dir().await?;

        self.phase(SyncPhase::ManifestCheck);
        let remote_manifest = self.ctx.remote_manifest_path();
        let mode = if self.transport.file_exists(&remote_manifest).await? {
            self.phase(SyncPhase::IncrementalSync);
            self.incremental_sync(&remote_manifest).await?
        } else {
            tracing::info!(
                host = %self.ctx.host,
                "no remote manifest at {remote_manifest}, uploading everything"
            );
            self.phase(SyncPhase::FullResync);
            self.full_resync().await?;
            SyncMode::Full
        };

        self.phase(SyncPhase::PublishManifest);
        self.upload(&self.ctx.manifest_path, &remote_manifest).await?;

        let restarted = match &self.restart {
            Some(plan) => {
                self.phase(SyncPhase::Restart);
                self.restart_service(plan).await?;
                true
            }
            None => false,
        };

        Ok(SyncReport {
            host: self.ctx.host.clone(),
            mode,
            restarted,
        })
    }

    async fn prepare_remote_dir(&self) -> Result<()> {
        self.action(SyncAction::Mkdir(self.ctx.remote_dir.clone()));
        self.transport.mkdir_all(&self.ctx.remote_dir).await?;

        if let Some(compose) = &self.ctx.compose_file {
            let remote = join_remote(&self.ctx.remote_dir, [REMOTE_COMPOSE_FILE]);
            self.upload(compose, &remote).await?;
        }
        Ok(())
    }

    async fn incremental_sync(&self, remote_manifest: &str) -> Result<SyncMode> {
        self.action(SyncAction::ReadManifest(remote_manifest.to_owned()));
        let bytes = self.transport.read_file(remote_manifest).await?;
        let origin = format!("{}:{remote_manifest}", self.ctx.host);
        let current = ManifestEntry::from_json(&bytes, &origin)?;
        let desired = ManifestEntry::load(&self.ctx.manifest_path).await?;

        let ops = diff(&desired, &current);
        let plan = SyncPlan::from_ops(&ops);
        tracing::info!(
            host = %self.ctx.host,
            deletions = plan.deletions.len(),
            uploads = plan.uploads.len(),
            "computed diff"
        );
        for op in &ops {
            tracing::debug!(host = %self.ctx.host, "{op}");
        }

        let remote_stage = self.ctx.remote_stage_dir();

        // All deletions settle before the first upload starts
        stream::iter(plan.deletions.iter().map(Ok::<_, color_eyre::Report>))
            .try_for_each_concurrent(MAX_CONCURRENT_OPS, |path| {
                let remote = join_remote(&remote_stage, path);
                async move { self.delete(&remote).await }
            })
            .await?;

        stream::iter(plan.uploads.iter().map(Ok::<_, color_eyre::Report>))
            .try_for_each_concurrent(MAX_CONCURRENT_OPS, |path| {
                let local = path.iter().fold(self.ctx.stage_dir.clone(), |acc, s| acc.join(s));
                let remote = join_remote(&remote_stage, path);
                async move { self.upload(&local, &remote).await }
            })
            .await?;

        Ok(SyncMode::Incremental {
            deleted: plan.deletions.len(),
            uploaded: plan.uploads.len(),
        })
    }

    async fn full_resync(&self) -> Result<()> {
        let remote_stage = self.ctx.remote_stage_dir();
        if self.transport.dir_exists(&remote_stage).await? {
            self.exec(&format!("rm -r {}", shell_quote(&remote_stage)))
                .await?;
        }
        self.upload(&self.ctx.stage_dir, &remote_stage).await
    }

    /// Remove a remote path of either type; absent paths are skipped
    async fn delete(&self, remote: &str) -> Result<()> {
        if self.transport.file_exists(remote).await? {
            self.action(SyncAction::Delete(remote.to_owned()));
            self.transport.remove_file(remote).await
        } else if self.transport.dir_exists(remote).await? {
            self.exec(&format!("rm -r {}", shell_quote(remote))).await
        } else {
            self.action(SyncAction::DeleteSkipped(remote.to_owned()));
            Ok(())
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.action(SyncAction::Upload {
            local: local.to_path_buf(),
            remote: remote.to_owned(),
        });
        let metadata = tokio::fs::metadata(local)
            .await
            .wrap_err_with(|| format!("failed to stat {}", local.display()))?;
        let uploaded = if metadata.is_dir() {
            self.transport.upload_dir(local, remote).await
        } else {
            self.transport.upload_file(local, remote).await
        };
        uploaded.wrap_err_with(|| format!("failed to upload {} to {remote}", local.display()))
    }

    async fn restart_service(&self, plan: &RestartPlan) -> Result<()> {
        if let Some(command) = &plan.command {
            return self.exec(command).await;
        }

        self.exec(&default_start_command(&self.ctx.remote_dir))
            .await?;

        tokio::time::sleep(plan.log_delay).await;
        let logs = format!(
            "cd {} && docker-compose logs --tail {}",
            shell_quote(&self.ctx.remote_dir),
            plan.log_tail
        );
        self.action(SyncAction::Exec(logs.clone()));
        let output = self.transport.exec(&logs).await?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(host = %self.ctx.host, "{line}");
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<()> {
        self.action(SyncAction::Exec(command.to_owned()));
        self.transport.exec(command).await.map(drop)
    }

    fn phase(&self, phase: SyncPhase) {
        self.reporter.phase(&self.ctx.host, phase);
    }

    fn action(&self, action: SyncAction) {
        self.reporter.action(&self.ctx.host, &action);
    }
}
