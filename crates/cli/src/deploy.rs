//! Build, then sync every selected host concurrently

use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use futures::future::{join_all, try_join_all};
use stagesync_core::build::{build_stage, run_local_commands};
use stagesync_core::{
    DeployConfig, HostSettings, RestartPlan, SyncContext, SyncExecutor, SyncReport, Target,
    Transport,
};
use stagesync_transport::{ConnectOptions, Connection, ConnectionSpec};
use tracing::{Instrument as _, info, warn};

use crate::debug_log;
use crate::progress::{DeployProgress, Status, print_status};

/// Which parts of the pipeline to run
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Only deploy to this instance
    pub host: Option<String>,
    /// Stage the existing build output without running build commands
    pub skip_build: bool,
    pub build_only: bool,
    /// Sync the already staged directory and manifest
    pub publish_only: bool,
}

/// Outcome of a deploy across all hosts
#[derive(Debug, Default)]
pub struct DeploySummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Run local hook commands from the config directory
///
/// With a host, `host` and `remote_dir` are available to the templates.
/// Host hooks are logged under the caller's [`debug_log::host_span`].
async fn run_hooks(
    config: &DeployConfig,
    name: &str,
    commands: &[String],
    host: Option<&str>,
) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    info!("running {name} hooks");
    let rendered = config.render_commands(commands, host)?;
    run_local_commands(&rendered, &config.config_dir)
        .await
        .wrap_err_with(|| format!("{name} hook failed"))
}

/// Run `pre` hooks, the build commands, and stage the output
///
/// # Errors
/// Returns an error if a hook or the build fails.
pub async fn build(config: &DeployConfig, skip_build: bool) -> Result<()> {
    let label = match (&config.project, &config.env) {
        (Some(project), Some(env)) => format!("{project} ({env})"),
        (Some(project), None) => project.clone(),
        _ => config.src_dir.display().to_string(),
    };
    print_status(Status::BUILDING, &label);

    run_hooks(config, "pre", &config.hooks.pre, None).await?;
    let manifest = build_stage(config, skip_build).await?;

    print_status(
        Status::BUILT,
        &format!(
            "{} files in {}",
            manifest.file_count(),
            config.local_stage_dir().display()
        ),
    );
    Ok(())
}

/// Full deploy pipeline
///
/// Configuration, hook and build errors are returned; per-host failures
/// are reported and counted in the summary instead.
///
/// # Errors
/// Returns an error for anything that fails before the host fan-out.
pub async fn deploy(config: &DeployConfig, options: &DeployOptions) -> Result<DeploySummary> {
    // Resolve every host up front so a config mistake fails before building
    let hosts = if options.build_only {
        Vec::new()
    } else {
        config
            .targets(options.host.as_deref())?
            .into_iter()
            .map(|target| {
                let settings = config.host_settings(&target.name)?;
                Ok((target, settings))
            })
            .collect::<Result<Vec<_>>>()?
    };

    if !options.publish_only {
        build(config, options.skip_build).await?;
    }
    if options.build_only {
        return Ok(DeploySummary::default());
    }

    let names: Vec<&str> = hosts.iter().map(|(t, _)| t.name.as_str()).collect();
    print_status(Status::DEPLOYING, &names.join(", "));

    let progress = DeployProgress::new();
    for (target, _) in &hosts {
        progress.add_host(&target.name);
    }

    let results = join_all(hosts.iter().map(|(target, settings)| {
        let progress = &progress;
        async move {
            let result =
                with_deploy_hooks(config, target, deploy_host(config, target, settings, progress))
                    .await;
            progress.host_finished(&target.name, result.as_ref());
            result
        }
        .instrument(debug_log::host_span(&target.name))
    }))
    .await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    let summary = DeploySummary {
        succeeded: results.len() - failed,
        failed,
    };
    progress.finish(summary.succeeded, summary.failed);

    Ok(summary)
}

/// Wrap one host's sync in its `pre_deploy` and `after_deploy` hooks
///
/// A failing hook fails the host. `after_deploy` only runs once the host
/// synced, whatever happens to the other hosts.
async fn with_deploy_hooks<F>(
    config: &DeployConfig,
    target: &Target,
    sync: F,
) -> Result<SyncReport>
where
    F: Future<Output = Result<SyncReport>>,
{
    let host = Some(target.name.as_str());
    run_hooks(config, "pre_deploy", &config.hooks.pre_deploy, host).await?;
    let report = sync.await?;
    run_hooks(config, "after_deploy", &config.hooks.after_deploy, host).await?;
    Ok(report)
}

/// Connect to one host, sync it, and always close the connection
async fn deploy_host(
    config: &DeployConfig,
    target: &Target,
    settings: &HostSettings,
    progress: &DeployProgress,
) -> Result<SyncReport> {
    let spec = ConnectionSpec::from_config(&target.ssh)?;
    let options = ConnectOptions {
        timeout: config.connect_timeout,
        retries: config.connect_retries,
    };
    let connection = Connection::open(&spec, &options)
        .await
        .wrap_err_with(|| format!("failed to connect to {}", target.name))?;

    let result = sync_host(config, target, settings, connection.transport(), progress).await;

    if let Err(err) = connection.close().await {
        warn!("{err:#}");
    }
    result
}

/// Sync one host over an open transport, then run its remote hooks
async fn sync_host<T: Transport + ?Sized>(
    config: &DeployConfig,
    target: &Target,
    settings: &HostSettings,
    transport: &T,
    progress: &DeployProgress,
) -> Result<SyncReport> {
    let ctx = SyncContext {
        host: target.name.clone(),
        stage_dir: config.local_stage_dir(),
        manifest_path: config.local_manifest_path(),
        remote_dir: settings.remote_dir.clone(),
        stage_name: config.stage_name.clone(),
        manifest_name: config.manifest_name.clone(),
        compose_file: settings.compose_file.clone(),
    };

    let mut executor = SyncExecutor::new(&ctx, transport, progress);
    if settings.compose_file.is_some() || settings.start_command.is_some() {
        executor = executor.with_restart(RestartPlan {
            command: settings.start_command.clone(),
            log_tail: config.remote.log_tail,
            log_delay: config.remote.log_delay,
        });
    }
    let report = executor.run().await?;

    try_join_all(
        settings
            .after_deploy_remote
            .iter()
            .map(|command| async move {
                info!("$ {command}");
                transport.exec(command).await
            }),
    )
    .await
    .wrap_err_with(|| format!("after_deploy_remote hook failed on {}", target.name))?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagesync_core::{PartialConfig, SyncMode};
    use stagesync_transport::LocalTransport;
    use tempfile::TempDir;

    fn config(dir: &std::path::Path, remote: &str) -> DeployConfig {
        let file = PartialConfig::parse(
            &format!(
                r#"
project = "site"
env = "test"
src_dir = "src"
stage_dir = "out"
deploy_dir = "deploy"
build_commands = ["mkdir -p out && echo hi > out/index.html"]

[remote]
dir = "{remote}/{{{{ project }}}}"
start_command = "touch {{{{ remote_dir }}}}/restarted"

[hooks]
pre = ["touch pre.ran"]
pre_deploy = ["touch {{{{ host }}}}.pre_deploy"]
after_deploy = ["touch {{{{ host }}}}.after_deploy"]
after_deploy_remote = ["touch {{{{ remote_dir }}}}/{{{{ host }}}}.done"]

[ssh.box1]
host = "127.0.0.1"

[ssh.box2]
host = "127.0.0.1"
port = 1
password = "unused"

[instances]
test = [{{ host = "box1" }}, {{ host = "box2" }}]
"#
            ),
            dir,
        )
        .unwrap();
        std::fs::create_dir_all(dir.join("src")).unwrap();
        PartialConfig::defaults().merge(file).resolve(dir).unwrap()
    }

    #[tokio::test]
    async fn test_build_runs_pre_hooks() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "/unused");

        build(&config, false).await.unwrap();
        assert!(tmp.path().join("pre.ran").exists());
        assert!(tmp.path().join("deploy/stage/index.html").exists());
        assert!(tmp.path().join("deploy/dirDigestMap.json").exists());
    }

    #[tokio::test]
    async fn test_build_only_needs_no_hosts() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(tmp.path(), "/unused");
        config.instances.clear();

        let summary = deploy(
            &config,
            &DeployOptions {
                build_only: true,
                ..DeployOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(summary.succeeded + summary.failed, 0);
        assert!(tmp.path().join("deploy/dirDigestMap.json").exists());
    }

    #[tokio::test]
    async fn test_config_errors_fail_before_build() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "/unused");

        let err = deploy(
            &config,
            &DeployOptions {
                host: Some("nope".to_string()),
                ..DeployOptions::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<stagesync_core::ConfigError>().is_some());
        assert!(!tmp.path().join("pre.ran").exists());
    }

    #[tokio::test]
    async fn test_sync_host_restarts_and_runs_remote_hooks() {
        let tmp = TempDir::new().unwrap();
        let remote_root = tmp.path().join("remote");
        let config = config(tmp.path(), remote_root.to_str().unwrap());
        build(&config, false).await.unwrap();

        let target = config.targets(None).unwrap().remove(0);
        let settings = config.host_settings(&target.name).unwrap();
        let progress = DeployProgress::new();
        let transport = LocalTransport::new("box1");

        let report = sync_host(&config, &target, &settings, &transport, &progress)
            .await
            .unwrap();

        assert_eq!(report.mode, SyncMode::Full);
        assert!(report.restarted);
        let remote = remote_root.join("site");
        assert!(remote.join("stage/index.html").exists());
        assert!(remote.join("restarted").exists());
        assert!(remote.join("box1.done").exists());
    }

    #[tokio::test]
    async fn test_after_deploy_runs_for_hosts_that_synced() {
        let tmp = TempDir::new().unwrap();
        let remote_root = tmp.path().join("remote");
        let config = config(tmp.path(), remote_root.to_str().unwrap());
        build(&config, false).await.unwrap();

        let targets = config.targets(None).unwrap();
        let settings = config.host_settings("box1").unwrap();
        let progress = DeployProgress::new();
        let transport = LocalTransport::new("box1");

        let (synced, failed) = futures::join!(
            with_deploy_hooks(
                &config,
                &targets[0],
                sync_host(&config, &targets[0], &settings, &transport, &progress),
            ),
            with_deploy_hooks(&config, &targets[1], async {
                Err::<SyncReport, _>(color_eyre::eyre::eyre!("connection refused"))
            }),
        );

        assert_eq!(synced.unwrap().mode, SyncMode::Full);
        assert!(failed.is_err());
        assert!(tmp.path().join("box1.pre_deploy").exists());
        assert!(tmp.path().join("box2.pre_deploy").exists());
        assert!(tmp.path().join("box1.after_deploy").exists());
        assert!(!tmp.path().join("box2.after_deploy").exists());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_counted_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "/unused");

        let summary = deploy(
            &config,
            &DeployOptions {
                host: Some("box2".to_string()),
                ..DeployOptions::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 1);
        assert!(tmp.path().join("box2.pre_deploy").exists());
        assert!(!tmp.path().join("box2.after_deploy").exists());
    }

    #[tokio::test]
    async fn test_failing_pre_deploy_skips_the_host() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(tmp.path(), "/unused");
        config.hooks.pre_deploy = vec!["test {{ host }} != box1".to_string()];
        let target = config.targets(Some("box1")).unwrap().remove(0);

        let err = with_deploy_hooks(&config, &target, async {
            Err::<SyncReport, _>(color_eyre::eyre::eyre!("sync must not start"))
        })
        .await
        .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("pre_deploy hook failed"), "{message}");
        assert!(!message.contains("sync must not start"));
    }
}
