//! Local transport
//!
//! Runs commands with `sh -c` and treats remote paths as local paths. Used to
//! exercise the sync engine without an SSH server.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use stagesync_core::remote::local_mode;
use stagesync_core::{CommandOutput, Transport};
use tokio::process::Command;
use tracing::debug;

/// Transport that operates on the local filesystem
pub struct LocalTransport {
    name: String,
}

impl LocalTransport {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new("localhost")
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.name, "$ {command}");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .wrap_err_with(|| format!("failed to spawn `{command}`"))?;

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt as _;
            output.status.signal().map(|s| s.to_string())
        };
        #[cfg(not(unix))]
        let signal = None;

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().and_then(|c| u32::try_from(c).ok()),
            signal,
        })
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn dir_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .wrap_err_with(|| format!("failed to create {path}"))
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .wrap_err_with(|| format!("failed to chmod {path}"))?;
        }
        #[cfg(not(unix))]
        let _ = (path, mode);
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(host = %self.name, "copy {} -> {remote}", local.display());
        tokio::fs::copy(local, remote)
            .await
            .wrap_err_with(|| format!("failed to copy {} to {remote}", local.display()))?;
        self.set_mode(remote, local_mode(local).await?).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("failed to read {path}"))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .wrap_err_with(|| format!("failed to remove {path}"))
    }
}
