//! Local build step: hook commands, staging the build output, writing the manifest

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail};
use ignore::WalkBuilder;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::DeployConfig;
use crate::manifest::{ManifestEntry, build_manifest};

/// Run shell commands one after another in `cwd`, stopping at the first failure
///
/// # Errors
/// Returns an error if a command cannot be spawned or exits non-zero.
pub async fn run_local_commands(commands: &[String], cwd: &Path) -> Result<()> {
    for command in commands {
        info!(cwd = %cwd.display(), "$ {command}");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .status()
            .await
            .wrap_err_with(|| format!("failed to spawn `{command}`"))?;

        if !status.success() {
            bail!("local command `{command}` failed with {status}");
        }
    }
    Ok(())
}

/// Replace `dest` with a copy of the tree at `source`
///
/// Symlinks and special files are skipped. Returns the number of files copied.
///
/// # Errors
/// Returns an error if `source` is missing or any copy fails.
pub async fn stage_tree(source: &Path, dest: &Path) -> Result<usize> {
    if !tokio::fs::metadata(source)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        bail!("build output {} is not a directory", source.display());
    }

    if tokio::fs::symlink_metadata(dest).await.is_ok() {
        tokio::fs::remove_dir_all(dest)
            .await
            .wrap_err_with(|| format!("failed to clear {}", dest.display()))?;
    }

    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&source, &dest)).await?
}

fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;

    let mut builder = WalkBuilder::new(source);
    builder.standard_filters(false).follow_links(false);

    let mut copied = 0;
    for result in builder.build() {
        let entry = result?;
        let relative = entry.path().strip_prefix(source)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target: PathBuf = dest.join(relative);

        match entry.file_type() {
            Some(ft) if ft.is_dir() => std::fs::create_dir_all(&target)?,
            Some(ft) if ft.is_file() => {
                std::fs::copy(entry.path(), &target).wrap_err_with(|| {
                    format!("failed to copy {}", entry.path().display())
                })?;
                copied += 1;
            }
            _ => debug!(path = %entry.path().display(), "skipping non-regular entry"),
        }
    }

    Ok(copied)
}

/// Produce the staged directory and its manifest for `config`
///
/// Runs `build_commands` in `src_dir` first unless `skip_commands` is set.
///
/// # Errors
/// Returns an error if a build command fails, the build output is missing,
/// or the manifest cannot be written.
pub async fn build_stage(config: &DeployConfig, skip_commands: bool) -> Result<ManifestEntry> {
    if skip_commands {
        info!("skipping build commands");
    } else {
        let commands = config.render_commands(&config.build_commands, None)?;
        run_local_commands(&commands, &config.src_dir).await?;
    }

    let stage = config.local_stage_dir();
    let copied = stage_tree(&config.source_stage_dir(), &stage).await?;
    info!(files = copied, dest = %stage.display(), "staged build output");

    let manifest = build_manifest(&stage).await?;
    manifest.save(&config.local_manifest_path()).await?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartialConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_local_commands() {
        let tmp = TempDir::new().unwrap();
        run_local_commands(
            &["echo one > out.txt".to_string(), "echo two >> out.txt".to_string()],
            tmp.path(),
        )
        .await
        .unwrap();

        let out = std::fs::read_to_string(tmp.path().join("out.txt")).unwrap();
        assert_eq!(out, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_run_local_commands_stops_on_failure() {
        let tmp = TempDir::new().unwrap();
        let err = run_local_commands(
            &["exit 3".to_string(), "touch never".to_string()],
            tmp.path(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("exit 3"));
        assert!(!tmp.path().join("never").exists());
    }

    #[tokio::test]
    async fn test_stage_tree_replaces_dest() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("out");
        std::fs::create_dir_all(source.join("assets")).unwrap();
        std::fs::write(source.join("index.html"), "<html>").unwrap();
        std::fs::write(source.join("assets/app.js"), "main()").unwrap();
        std::fs::write(source.join(".env"), "HIDDEN=1").unwrap();

        let dest = tmp.path().join("stage");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        let copied = stage_tree(&source, &dest).await.unwrap();
        assert_eq!(copied, 3);
        assert!(!dest.join("stale.txt").exists());
        assert_eq!(std::fs::read_to_string(dest.join("assets/app.js")).unwrap(), "main()");
        assert!(dest.join(".env").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stage_tree_skips_symlinks() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("out");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink(source.join("real.txt"), source.join("link.txt")).unwrap();

        let dest = tmp.path().join("stage");
        assert_eq!(stage_tree(&source, &dest).await.unwrap(), 1);
        assert!(!dest.join("link.txt").exists());
    }

    #[tokio::test]
    async fn test_stage_tree_missing_source() {
        let tmp = TempDir::new().unwrap();
        assert!(
            stage_tree(&tmp.path().join("missing"), &tmp.path().join("stage"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_build_stage_writes_manifest() {
        let tmp = TempDir::new().unwrap();
        let file = PartialConfig::parse(
            r#"
src_dir = "app"
stage_dir = "dist"
deploy_dir = "deploy"
build_commands = ["mkdir -p dist && echo built > dist/app.txt"]
"#,
            tmp.path(),
        )
        .unwrap();
        std::fs::create_dir_all(tmp.path().join("app")).unwrap();
        let config = PartialConfig::defaults()
            .merge(file)
            .resolve(tmp.path())
            .unwrap();

        let manifest = build_stage(&config, false).await.unwrap();
        assert_eq!(manifest.file_count(), 1);
        assert!(manifest.get(&["app.txt"]).is_some());

        let saved = ManifestEntry::load(&tmp.path().join("deploy/dirDigestMap.json"))
            .await
            .unwrap();
        assert_eq!(saved, manifest);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("deploy/stage/app.txt")).unwrap(),
            "built\n"
        );

        // Skipping commands restages the existing output
        std::fs::write(tmp.path().join("app/dist/extra.txt"), "more").unwrap();
        let manifest = build_stage(&config, true).await.unwrap();
        assert_eq!(manifest.file_count(), 2);
    }
}
