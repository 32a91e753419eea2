//! Per-env compose files rendered from one template
//!
//! ```toml
//! project = "shop"
//!
//! [env.production]
//! vars = { replicas = "3" }
//!
//! [env.staging]
//! name = "compose.staging.yml"
//! dir = "deploy"
//! ```
//!
//! Every env gets `env` and `project` as template variables, then its own
//! `vars` on top.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use futures::future::try_join_all;
use serde::Deserialize;
use tracing::debug;

use crate::config::ConfigError;
use crate::template::{self, TemplateVars};

/// Default compose generator config file
pub const COMPOSE_CONFIG_FILE: &str = "stagesync-compose.toml";

/// Output directory used when an env sets no `dir`
pub const DEFAULT_OUTPUT_DIR: &str = "ymls";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComposeConfig {
    pub project: Option<String>,
    pub env: BTreeMap<String, ComposeEnv>,
}

/// Output settings for one env
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComposeEnv {
    /// File name (default: `docker-compose-<env>.yml`)
    pub name: Option<String>,
    /// Directory relative to the config file
    pub dir: Option<PathBuf>,
    pub vars: BTreeMap<String, String>,
}

/// One rendered compose file, not yet written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCompose {
    pub env: String,
    pub path: PathBuf,
    pub content: String,
}

impl ComposeConfig {
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).wrap_err_with(|| format!("invalid compose config {}", path.display()))
    }

    /// Template variables for `env`
    #[must_use]
    pub fn vars(&self, env: &str) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.insert("env".to_string(), env.to_string());
        if let Some(project) = &self.project {
            vars.insert("project".to_string(), project.clone());
        }
        if let Some(settings) = self.env.get(env) {
            vars.extend(settings.vars.clone());
        }
        vars
    }

    /// Render `template` once per env; output paths are relative to `base`
    ///
    /// # Errors
    /// Fails on the first template error, before anything is written.
    pub fn render_all(&self, template: &str, base: &Path) -> Result<Vec<RenderedCompose>, ConfigError> {
        self.env
            .iter()
            .map(|(env, settings)| {
                let name = settings
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("docker-compose-{env}.yml"));
                let dir = settings
                    .dir
                    .as_deref()
                    .unwrap_or_else(|| Path::new(DEFAULT_OUTPUT_DIR));
                Ok(RenderedCompose {
                    env: env.clone(),
                    path: base.join(dir).join(name),
                    content: template::render(template, &self.vars(env))?,
                })
            })
            .collect()
    }
}

/// Render the template at `template_path` for every env in the config at
/// `config_path` and write the results
///
/// # Errors
/// Returns an error if either file is unreadable, a template variable is
/// unknown, or an output file cannot be written.
pub async fn generate(template_path: &Path, config_path: &Path) -> Result<Vec<RenderedCompose>> {
    let template = tokio::fs::read_to_string(template_path)
        .await
        .wrap_err_with(|| format!("failed to read {}", template_path.display()))?;
    let config = ComposeConfig::load(config_path)?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));

    let rendered = config.render_all(&template, base)?;
    try_join_all(rendered.iter().map(|file| async move {
        if let Some(parent) = file.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file.path, &file.content)
            .await
            .wrap_err_with(|| format!("failed to write {}", file.path.display()))?;
        debug!(env = %file.env, "wrote {}", file.path.display());
        Ok::<_, color_eyre::Report>(())
    }))
    .await?;

    Ok(rendered)
}
