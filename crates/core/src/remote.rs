//! The remote host abstraction the sync engine runs over
//!
//! Remote paths are POSIX strings regardless of the local platform.

use std::path::Path;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use futures::stream::{self, TryStreamExt as _};

use crate::manifest::ManifestError;

/// Remote operations one caller keeps in flight at a time
pub const MAX_CONCURRENT_OPS: usize = 8;

/// A remote command exited unsuccessfully
#[derive(Debug, Clone, thiserror::Error)]
#[error("command exited with code {}, signal {}: {command}", fmt_opt(.exit_code), fmt_opt(.signal))]
pub struct RemoteCommandError {
    pub command: String,
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
    pub stderr: String,
}

fn fmt_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "none".to_owned(), ToString::to_string)
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    /// Turn a non-zero exit into a [`RemoteCommandError`]
    pub fn check(self, command: &str) -> Result<Self, RemoteCommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteCommandError {
                command: command.to_owned(),
                exit_code: self.exit_code,
                signal: self.signal,
                stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            })
        }
    }
}

/// Command execution and file operations against one remote host
///
/// One handle belongs to exactly one sync run; implementations must allow
/// operations to be issued concurrently through a shared reference.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Host identifier used in diagnostics
    fn host(&self) -> &str;

    /// Run a command and capture its output without judging the exit status
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Run a command, failing with [`RemoteCommandError`] on a non-zero exit
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let output = self.run(command).await?;
        Ok(output.check(command)?)
    }

    async fn file_exists(&self, path: &str) -> Result<bool>;

    async fn dir_exists(&self, path: &str) -> Result<bool>;

    /// Create a directory and any missing parents
    async fn mkdir_all(&self, path: &str) -> Result<()>;

    /// Set permission bits on a remote path
    async fn set_mode(&self, path: &str, mode: u32) -> Result<()>;

    /// Upload one local file, carrying over its permission bits
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Mirror a local directory tree onto the remote host
    ///
    /// Missing remote directories are created with the local directory's
    /// mode. Up to [`MAX_CONCURRENT_OPS`] siblings at each level are uploaded
    /// concurrently. Entries that are neither files nor directories are
    /// skipped; a non-UTF-8 name is an error.
    async fn upload_dir(&self, local: &Path, remote: &str) -> Result<()> {
        if !self.dir_exists(remote).await? {
            self.mkdir_all(remote).await?;
            self.set_mode(remote, local_mode(local).await?).await?;
        }

        let mut read_dir = tokio::fs::read_dir(local)
            .await
            .wrap_err_with(|| format!("failed to list {}", local.display()))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(entry);
        }

        stream::iter(entries.into_iter().map(Ok::<_, color_eyre::Report>))
            .try_for_each_concurrent(MAX_CONCURRENT_OPS, |entry| async move {
                let local_path = entry.path();
                let file_type = tokio::fs::symlink_metadata(&local_path).await?.file_type();
                if !file_type.is_dir() && !file_type.is_file() {
                    return Ok(());
                }

                let name = entry
                    .file_name()
                    .into_string()
                    .map_err(|_| ManifestError::NonUtf8Name {
                        path: local_path.clone(),
                    })?;
                let remote_path = join_remote(remote, [name.as_str()]);
                if file_type.is_dir() {
                    self.upload_dir(&local_path, &remote_path).await
                } else {
                    self.upload_file(&local_path, &remote_path).await
                }
            })
            .await
    }
}

/// Permission bits of a local path
pub async fn local_mode(path: &Path) -> Result<u32> {
    let metadata = tokio::fs::metadata(path)
        .await
        .wrap_err_with(|| format!("failed to stat {}", path.display()))?;

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt as _;
        metadata.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let mode = if metadata.is_dir() { 0o755 } else { 0o644 };

    Ok(mode)
}

/// Join path segments onto a remote base path with `/`
#[must_use]
pub fn join_remote<I, S>(base: &str, segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut path = base.trim_end_matches('/').to_owned();
    for segment in segments {
        path.push('/');
        path.push_str(segment.as_ref());
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Quote a string for a POSIX shell
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':' | '=' | '~'))
        && !s.starts_with('~')
    {
        return s.to_owned();
    }

    let mut result = String::from("'");
    for ch in s.chars() {
        if ch == '\'' {
            result.push_str("'\\''");
        } else {
            result.push(ch);
        }
    }
    result.push('\'');
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    /// Records uploads and how many were in flight at once
    #[derive(Default)]
    struct CountingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        uploaded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn host(&self) -> &str {
            "counting"
        }

        async fn run(&self, _command: &str) -> Result<CommandOutput> {
            Ok(CommandOutput::default())
        }

        async fn file_exists(&self, _path: &str) -> Result<bool> {
            Ok(false)
        }

        async fn dir_exists(&self, _path: &str) -> Result<bool> {
            Ok(true)
        }

        async fn mkdir_all(&self, _path: &str) -> Result<()> {
            Ok(())
        }

        async fn set_mode(&self, _path: &str, _mode: u32) -> Result<()> {
            Ok(())
        }

        async fn upload_file(&self, _local: &Path, remote: &str) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.uploaded.lock().unwrap().push(remote.to_owned());
            Ok(())
        }

        async fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn remove_file(&self, _path: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upload_dir_bounds_concurrency() {
        let dir = TempDir::new().unwrap();
        for i in 0..30 {
            std::fs::write(dir.path().join(format!("f{i:02}.txt")), "x").unwrap();
        }
        let transport = CountingTransport::default();

        transport.upload_dir(dir.path(), "/srv/app/stage").await.unwrap();

        let uploaded = transport.uploaded.lock().unwrap();
        assert_eq!(uploaded.len(), 30);
        assert!(uploaded.contains(&"/srv/app/stage/f29.txt".to_owned()));
        let peak = transport.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "uploads should overlap");
        assert!(peak <= MAX_CONCURRENT_OPS, "peak {peak} over the limit");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_upload_dir_rejects_non_utf8_name() {
        use std::os::unix::ffi::OsStrExt as _;

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(std::ffi::OsStr::from_bytes(b"caf\xe9")), "x").unwrap();
        let transport = CountingTransport::default();

        let err = transport.upload_dir(dir.path(), "/srv/app").await.unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<ManifestError>(),
            Some(ManifestError::NonUtf8Name { .. })
        )));
        assert!(transport.uploaded.lock().unwrap().is_empty());
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/srv/app", ["stage", "a.txt"]), "/srv/app/stage/a.txt");
        assert_eq!(join_remote("/srv/app/", ["stage"]), "/srv/app/stage");
        assert_eq!(join_remote("/", ["etc"]), "/etc");
        assert_eq!(join_remote("/srv", Vec::<String>::new()), "/srv");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/srv/app/stage"), "/srv/app/stage");
        assert_eq!(shell_quote("my file"), "'my file'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote("~/x"), "'~/x'");
    }

    #[test]
    fn test_command_output_check() {
        let ok = CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        };
        assert!(ok.check("true").is_ok());

        let failed = CommandOutput {
            exit_code: Some(2),
            stderr: b"boom".to_vec(),
            ..CommandOutput::default()
        };
        let err = failed.check("make deploy").unwrap_err();
        assert_eq!(err.exit_code, Some(2));
        assert_eq!(err.stderr, "boom");
        assert_eq!(
            err.to_string(),
            "command exited with code 2, signal none: make deploy"
        );

        let killed = CommandOutput {
            exit_code: None,
            signal: Some("KILL".to_owned()),
            ..CommandOutput::default()
        };
        let err = killed.check("sleep 100").unwrap_err();
        assert_eq!(err.signal.as_deref(), Some("KILL"));
    }
}
