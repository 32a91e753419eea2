//! stagesync: Incremental deploys of a staged build directory
//!
//! Builds a project, stages its output, and syncs it to every host of an
//! environment by content digest:
//! - Only changed files are transferred
//! - Direct or proxied (jump host) SSH connections
//! - docker-compose restart with a log tail afterwards

mod debug_log;
mod deploy;
mod progress;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use stagesync_core::compose::{self, COMPOSE_CONFIG_FILE};
use stagesync_core::config::{CONFIG_FILE, PartialRemote};
use stagesync_core::{DeployConfig, ManifestEntry, PartialConfig, build_manifest, diff};
use tracing::{debug, info};

use crate::deploy::DeployOptions;
use crate::progress::{Status, print_status};

/// Process exit status when at least one host failed to deploy
const EXIT_HOST_FAILURE: u8 = 2;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "stagesync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Incrementally sync a staged build to remote hosts")]
#[command(long_about = r#"
stagesync builds your project, stages the output, and uploads only what
changed to every host of an environment, then restarts the service.

Features:
  • Content digests  - unchanged files are never re-sent
  • Safe fallback    - full upload when the remote state is unknown
  • Jump hosts       - tunnels through a proxy over SSH
  • docker-compose   - restart and show the log tail after deploy

Examples:
  stagesync deploy --env production          Build and deploy
  stagesync deploy --env staging --host web1 Deploy one host
  stagesync build                            Build and stage only
  stagesync diff new.json old.json           Compare two manifests
  stagesync compose                          Render docker-compose-<env>.yml files
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where configuration comes from
#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Project config file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Machine-local config layered over the project config
    #[arg(long)]
    machine_config: Option<PathBuf>,

    /// Select an `[apps.<name>]` table, layered over `[common]`
    #[arg(short, long, env = "STAGESYNC_APP")]
    app: Option<String>,

    /// Environment whose instances are deployed
    #[arg(short, long)]
    env: Option<String>,

    /// Project source directory
    #[arg(long)]
    src_dir: Option<PathBuf>,

    /// Directory holding the staged output and manifest
    #[arg(long)]
    deploy_dir: Option<PathBuf>,

    /// Local compose file uploaded as docker-compose.yml
    #[arg(long)]
    compose_file: Option<String>,

    /// Remote command that replaces the default docker-compose restart
    #[arg(long)]
    start_command: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, stage and deploy to every host of an environment
    Deploy {
        #[command(flatten)]
        config: ConfigArgs,

        /// Only deploy to this instance
        #[arg(long, env = "STAGESYNC_HOST")]
        host: Option<String>,

        /// Skip build commands and stage the existing output
        #[arg(long, env = "STAGESYNC_SKIP_BUILD")]
        skip_build: bool,

        /// Stop after building
        #[arg(long, conflicts_with = "publish_only")]
        build_only: bool,

        /// Deploy the already staged output without building
        #[arg(long)]
        publish_only: bool,
    },

    /// Run the build and stage its output
    Build {
        #[command(flatten)]
        config: ConfigArgs,

        /// Skip build commands and stage the existing output
        #[arg(long, env = "STAGESYNC_SKIP_BUILD")]
        skip_build: bool,
    },

    /// Build a manifest for a directory
    Manifest {
        /// Directory to hash
        path: PathBuf,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the operations that turn one manifest into another
    Diff {
        /// Manifest of the desired state
        desired: PathBuf,

        /// Manifest of the current state
        current: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = DiffFormat::Summary)]
        format: DiffFormat,
    },

    /// Render a compose template into one file per env
    Compose {
        /// Compose file template
        #[arg(short, long, default_value = "docker-compose.tpl.yml")]
        template: PathBuf,

        /// Envs to render and their variables
        #[arg(short, long, default_value = COMPOSE_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Show version and build info
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DiffFormat {
    Json,
    Summary,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    debug!("Debug log: {}", session.log_path.display());

    match cli.command {
        Commands::Version => {
            eprintln!("stagesync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Manifest { path, output } => {
            manifest_command(&path, output.as_deref()).await?;
        }
        Commands::Diff {
            desired,
            current,
            format,
        } => {
            diff_command(&desired, &current, format).await?;
        }
        Commands::Compose { template, config } => {
            compose_command(&template, &config).await?;
        }
        Commands::Build { config, skip_build } => {
            let config = load_config(&config)?;
            deploy::build(&config, skip_build).await?;
        }
        Commands::Deploy {
            config,
            host,
            skip_build,
            build_only,
            publish_only,
        } => {
            let config = load_config(&config)?;
            let options = DeployOptions {
                host,
                skip_build,
                build_only,
                publish_only,
            };
            let summary = deploy::deploy(&config, &options).await?;
            if summary.failed > 0 {
                eprintln!("Debug log: {}", session.log_path.display());
                return Ok(ExitCode::from(EXIT_HOST_FAILURE));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Layer defaults, the project file, the machine file and flags
fn load_config(args: &ConfigArgs) -> Result<DeployConfig> {
    let cwd = std::env::current_dir().wrap_err("cannot determine working directory")?;
    let config_path = cwd.join(&args.config);
    let config_dir = config_path.parent().unwrap_or(cwd.as_path()).to_path_buf();

    let app = args.app.as_deref();
    let project = PartialConfig::load(&config_path)?.select_app(app)?;
    let mut merged = PartialConfig::defaults().merge(project);
    if let Some(machine) = &args.machine_config {
        let machine = PartialConfig::load(&cwd.join(machine))?;
        // The machine file only needs a table for the apps it overrides
        let app = app.filter(|name| machine.apps.contains_key(*name));
        merged = merged.merge(machine.select_app(app)?);
    }

    let mut flags = PartialConfig {
        env: args.env.clone(),
        src_dir: args.src_dir.clone(),
        deploy_dir: args.deploy_dir.clone(),
        remote: PartialRemote {
            compose_file: args.compose_file.clone(),
            start_command: args.start_command.clone(),
            ..PartialRemote::default()
        },
        ..PartialConfig::default()
    };
    flags.resolve_paths(&cwd);

    let config = merged.merge(flags).resolve(&config_dir)?;
    debug!(
        config_dir = %config.config_dir.display(),
        env = ?config.env,
        project = ?config.project,
        "resolved config"
    );
    Ok(config)
}

async fn manifest_command(path: &Path, output: Option<&Path>) -> Result<()> {
    info!("Hashing {}...", path.display());
    let manifest = build_manifest(path).await?;

    match output {
        Some(file) => {
            manifest.save(file).await?;
            print_status(
                Status::WROTE,
                &format!("{} files to {}", manifest.file_count(), file.display()),
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&manifest.to_json_pretty()?)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

async fn compose_command(template: &Path, config: &Path) -> Result<()> {
    let written = compose::generate(template, config).await?;
    if written.is_empty() {
        print_status(Status::SKIPPED, &format!("no envs in {}", config.display()));
    }
    for file in &written {
        print_status(
            Status::WROTE,
            &format!("{} for {}", file.path.display(), file.env),
        );
    }
    Ok(())
}

async fn diff_command(desired: &Path, current: &Path, format: DiffFormat) -> Result<()> {
    let desired = ManifestEntry::load(desired).await?;
    let current = ManifestEntry::load(current).await?;
    let ops = diff(&desired, &current);

    let mut stdout = std::io::stdout().lock();
    match format {
        DiffFormat::Json => {
            writeln!(stdout, "{}", serde_json::to_string_pretty(&ops)?)?;
        }
        DiffFormat::Summary => {
            let mut sorted: Vec<_> = ops.iter().collect();
            sorted.sort_by(|a, b| a.path.cmp(&b.path));
            for op in &sorted {
                writeln!(stdout, "{op}")?;
            }
            writeln!(stdout, "{} change(s)", ops.len())?;
        }
    }
    Ok(())
}
