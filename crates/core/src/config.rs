//! Deploy configuration (stagesync.toml)
//!
//! Configuration arrives in layers: built-in defaults, the project file, an
//! optional machine file, and command-line overrides. Each layer is a
//! [`PartialConfig`]; layers are combined with [`PartialConfig::merge`] and
//! resolved once into a [`DeployConfig`].
//!
//! A file that describes several apps puts shared settings under `[common]`
//! and each app under `[apps.<name>]`; [`PartialConfig::select_app`] folds
//! them into a single layer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::WrapErr as _;
use serde::Deserialize;

use crate::manifest::MANIFEST_FILE;
use crate::template::{self, TemplateVars};

/// Config file name
pub const CONFIG_FILE: &str = "stagesync.toml";

/// A configuration problem detected before any remote work starts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("no instances configured for env `{0}`")]
    NoInstances(String),

    #[error("host `{0}` has no [ssh.{0}] entry")]
    UnknownHost(String),

    #[error("host `{host}` is not an instance of env `{env}`")]
    HostNotInEnv { host: String, env: String },

    #[error("proxy for host `{0}` has no `host` set")]
    MissingProxyHost(String),

    #[error("unknown template variable `{name}` in `{template}`")]
    UnknownVariable { name: String, template: String },

    #[error("unclosed placeholder in `{0}`")]
    UnclosedPlaceholder(String),

    #[error("no [apps.{0}] entry")]
    UnknownApp(String),
}

/// SSH settings for one named host, or for the proxy in front of it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshHostConfig {
    /// Address to connect to (default: the table name)
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Inline private key material
    pub private_key: Option<String>,

    pub private_key_file: Option<PathBuf>,

    pub password: Option<String>,

    /// Check the server key against `~/.ssh/known_hosts`
    #[serde(default)]
    pub verify_host_key: bool,

    /// Jump host the connection is tunneled through
    pub proxy: Option<Box<SshHostConfig>>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl SshHostConfig {
    /// Config for `address` with every other setting at its default
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            host: Some(address.into()),
            port: default_port(),
            user: default_user(),
            private_key: None,
            private_key_file: None,
            password: None,
            verify_host_key: false,
            proxy: None,
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        if let Some(key_file) = &self.private_key_file {
            if !key_file.starts_with("~") {
                self.private_key_file = Some(base.join(key_file));
            }
        }
        if let Some(proxy) = &mut self.proxy {
            proxy.resolve_paths(base);
        }
    }
}

/// One deploy target within an env
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Instance {
    /// Name of an `[ssh.<name>]` table
    pub host: String,
}

/// `[remote]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialRemote {
    pub dir: Option<String>,
    pub compose_file: Option<String>,
    pub start_command: Option<String>,
    pub log_tail: Option<u32>,
    pub log_delay_secs: Option<u64>,
}

/// `[hooks]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialHooks {
    pub pre: Option<Vec<String>>,
    pub pre_deploy: Option<Vec<String>>,
    pub after_deploy: Option<Vec<String>>,
    pub after_deploy_remote: Option<Vec<String>>,
}

/// One configuration layer; every setting is optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialConfig {
    pub project: Option<String>,
    pub env: Option<String>,
    pub src_dir: Option<PathBuf>,
    /// Build output directory, relative to `src_dir`
    pub stage_dir: Option<PathBuf>,
    pub deploy_dir: Option<PathBuf>,
    pub stage_name: Option<String>,
    pub manifest_name: Option<String>,
    pub build_commands: Option<Vec<String>>,
    pub connect_retries: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub remote: PartialRemote,
    pub hooks: PartialHooks,
    pub ssh: BTreeMap<String, SshHostConfig>,
    pub instances: BTreeMap<String, Vec<Instance>>,
    /// Settings every app in `apps` starts from
    pub common: Option<Box<PartialConfig>>,
    pub apps: BTreeMap<String, PartialConfig>,
}

/// Pick the override when present
fn over<T>(base: Option<T>, top: Option<T>) -> Option<T> {
    top.or(base)
}

impl PartialConfig {
    /// The built-in defaults layer
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            src_dir: Some(PathBuf::from(".")),
            stage_dir: Some(PathBuf::from("target/docker/stage")),
            deploy_dir: Some(PathBuf::from(".")),
            stage_name: Some("stage".to_string()),
            manifest_name: Some(MANIFEST_FILE.to_string()),
            connect_retries: Some(0),
            connect_timeout_secs: Some(30),
            remote: PartialRemote {
                log_tail: Some(100),
                log_delay_secs: Some(5),
                ..PartialRemote::default()
            },
            ..Self::default()
        }
    }

    /// Load a config file, resolving its relative paths against its directory.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, base).wrap_err_with(|| format!("invalid config {}", path.display()))
    }

    /// Parse TOML text whose relative paths are relative to `base`
    ///
    /// # Errors
    /// Returns an error if the text is not a valid config.
    pub fn parse(content: &str, base: &Path) -> color_eyre::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.resolve_paths(base);
        Ok(config)
    }

    /// Make every relative path in this layer relative to `base`
    ///
    /// `stage_dir` is left alone since it is relative to `src_dir`, and
    /// `~`-prefixed key files are expanded at connect time.
    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in [&mut self.src_dir, &mut self.deploy_dir].into_iter().flatten() {
            *dir = base.join(&*dir);
        }
        if let Some(compose) = &mut self.remote.compose_file {
            if Path::new(compose.as_str()).is_relative() {
                *compose = base.join(&*compose).to_string_lossy().into_owned();
            }
        }
        for ssh in self.ssh.values_mut() {
            ssh.resolve_paths(base);
        }
        if let Some(common) = &mut self.common {
            common.resolve_paths(base);
        }
        for app in self.apps.values_mut() {
            app.resolve_paths(base);
        }
    }

    /// Fold `[common]` and `[apps.<app>]` over the rest of this layer
    ///
    /// Precedence is top-level keys, then `common`, then the app. An app
    /// that sets no `project` takes its table name. Without an app only
    /// `common` is applied.
    ///
    /// # Errors
    /// Returns [`ConfigError::UnknownApp`] if `app` has no table.
    pub fn select_app(mut self, app: Option<&str>) -> Result<Self, ConfigError> {
        let common = self.common.take().map(|c| *c).unwrap_or_default();
        let mut apps = std::mem::take(&mut self.apps);

        let mut selected = self.merge(common);
        if let Some(name) = app {
            let layer = apps
                .remove(name)
                .ok_or_else(|| ConfigError::UnknownApp(name.to_owned()))?;
            selected = selected.merge(layer);
            if selected.project.is_none() {
                selected.project = Some(name.to_owned());
            }
        }
        selected.common = None;
        selected.apps.clear();
        Ok(selected)
    }

    /// Layer `top` over `self`
    ///
    /// Scalars and lists from `top` replace those in `self`. `ssh` and
    /// `instances` tables are merged per key, with `top` winning.
    #[must_use]
    pub fn merge(self, top: Self) -> Self {
        let mut ssh = self.ssh;
        ssh.extend(top.ssh);
        let mut instances = self.instances;
        instances.extend(top.instances);
        let common = match (self.common, top.common) {
            (Some(base), Some(top)) => Some(Box::new(base.merge(*top))),
            (base, top) => top.or(base),
        };
        let mut apps = self.apps;
        for (name, layer) in top.apps {
            let merged = match apps.remove(&name) {
                Some(base) => base.merge(layer),
                None => layer,
            };
            apps.insert(name, merged);
        }

        Self {
            project: over(self.project, top.project),
            env: over(self.env, top.env),
            src_dir: over(self.src_dir, top.src_dir),
            stage_dir: over(self.stage_dir, top.stage_dir),
            deploy_dir: over(self.deploy_dir, top.deploy_dir),
            stage_name: over(self.stage_name, top.stage_name),
            manifest_name: over(self.manifest_name, top.manifest_name),
            build_commands: over(self.build_commands, top.build_commands),
            connect_retries: over(self.connect_retries, top.connect_retries),
            connect_timeout_secs: over(self.connect_timeout_secs, top.connect_timeout_secs),
            remote: PartialRemote {
                dir: over(self.remote.dir, top.remote.dir),
                compose_file: over(self.remote.compose_file, top.remote.compose_file),
                start_command: over(self.remote.start_command, top.remote.start_command),
                log_tail: over(self.remote.log_tail, top.remote.log_tail),
                log_delay_secs: over(self.remote.log_delay_secs, top.remote.log_delay_secs),
            },
            hooks: PartialHooks {
                pre: over(self.hooks.pre, top.hooks.pre),
                pre_deploy: over(self.hooks.pre_deploy, top.hooks.pre_deploy),
                after_deploy: over(self.hooks.after_deploy, top.hooks.after_deploy),
                after_deploy_remote: over(
                    self.hooks.after_deploy_remote,
                    top.hooks.after_deploy_remote,
                ),
            },
            ssh,
            instances,
            common,
            apps,
        }
    }

    /// Resolve the merged layers into a complete config.
    ///
    /// `config_dir` anchors any path that is still relative and is the
    /// working directory for local hooks.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] for any setting the defaults layer
    /// would have supplied.
    pub fn resolve(self, config_dir: &Path) -> Result<DeployConfig, ConfigError> {
        let required_path = |value: Option<PathBuf>, name| {
            value
                .map(|p| config_dir.join(p))
                .ok_or(ConfigError::Missing(name))
        };

        Ok(DeployConfig {
            project: self.project,
            env: self.env,
            config_dir: config_dir.to_path_buf(),
            src_dir: required_path(self.src_dir, "src_dir")?,
            stage_dir: self.stage_dir.ok_or(ConfigError::Missing("stage_dir"))?,
            deploy_dir: required_path(self.deploy_dir, "deploy_dir")?,
            stage_name: self.stage_name.ok_or(ConfigError::Missing("stage_name"))?,
            manifest_name: self
                .manifest_name
                .ok_or(ConfigError::Missing("manifest_name"))?,
            build_commands: self.build_commands.unwrap_or_default(),
            connect_retries: self.connect_retries.unwrap_or(0),
            connect_timeout: Duration::from_secs(
                self.connect_timeout_secs
                    .ok_or(ConfigError::Missing("connect_timeout_secs"))?,
            ),
            remote: RemoteConfig {
                dir: self.remote.dir,
                compose_file: self.remote.compose_file,
                start_command: self.remote.start_command,
                log_tail: self
                    .remote
                    .log_tail
                    .ok_or(ConfigError::Missing("remote.log_tail"))?,
                log_delay: Duration::from_secs(
                    self.remote
                        .log_delay_secs
                        .ok_or(ConfigError::Missing("remote.log_delay_secs"))?,
                ),
            },
            hooks: HooksConfig {
                pre: self.hooks.pre.unwrap_or_default(),
                pre_deploy: self.hooks.pre_deploy.unwrap_or_default(),
                after_deploy: self.hooks.after_deploy.unwrap_or_default(),
                after_deploy_remote: self.hooks.after_deploy_remote.unwrap_or_default(),
            },
            ssh: self.ssh,
            instances: self.instances,
        })
    }
}

/// Resolved `[remote]` settings; string fields are still templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub dir: Option<String>,
    pub compose_file: Option<String>,
    pub start_command: Option<String>,
    pub log_tail: u32,
    pub log_delay: Duration,
}

/// Resolved `[hooks]` settings; commands are still templates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HooksConfig {
    pub pre: Vec<String>,
    pub pre_deploy: Vec<String>,
    pub after_deploy: Vec<String>,
    pub after_deploy_remote: Vec<String>,
}

/// A fully merged configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    pub project: Option<String>,
    pub env: Option<String>,
    pub config_dir: PathBuf,
    pub src_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub deploy_dir: PathBuf,
    pub stage_name: String,
    pub manifest_name: String,
    pub build_commands: Vec<String>,
    pub connect_retries: u32,
    pub connect_timeout: Duration,
    pub remote: RemoteConfig,
    pub hooks: HooksConfig,
    pub ssh: BTreeMap<String, SshHostConfig>,
    pub instances: BTreeMap<String, Vec<Instance>>,
}

/// A host selected for deployment, with its SSH settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub ssh: SshHostConfig,
}

/// Per-host settings with every template rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    pub remote_dir: String,
    pub compose_file: Option<PathBuf>,
    pub start_command: Option<String>,
    pub after_deploy_remote: Vec<String>,
}

impl DeployConfig {
    /// Where the build step stages content for upload
    #[must_use]
    pub fn local_stage_dir(&self) -> PathBuf {
        self.deploy_dir.join(&self.stage_name)
    }

    #[must_use]
    pub fn local_manifest_path(&self) -> PathBuf {
        self.deploy_dir.join(&self.manifest_name)
    }

    /// Where the build commands leave their output
    #[must_use]
    pub fn source_stage_dir(&self) -> PathBuf {
        self.src_dir.join(&self.stage_dir)
    }

    /// Hosts to deploy to for the selected env, optionally narrowed to one
    ///
    /// # Errors
    /// Fails if no env is selected, the env has no instances, an instance
    /// has no SSH settings, or `only` is not one of the env's instances.
    pub fn targets(&self, only: Option<&str>) -> Result<Vec<Target>, ConfigError> {
        let env = self.env.as_deref().ok_or(ConfigError::Missing("env"))?;
        let instances = self
            .instances
            .get(env)
            .filter(|list| !list.is_empty())
            .ok_or_else(|| ConfigError::NoInstances(env.to_string()))?;

        let selected: Vec<&Instance> = match only {
            Some(host) => {
                let matching: Vec<_> = instances.iter().filter(|i| i.host == host).collect();
                if matching.is_empty() {
                    return Err(ConfigError::HostNotInEnv {
                        host: host.to_string(),
                        env: env.to_string(),
                    });
                }
                matching
            }
            None => instances.iter().collect(),
        };

        selected
            .into_iter()
            .map(|instance| self.target(&instance.host))
            .collect()
    }

    fn target(&self, name: &str) -> Result<Target, ConfigError> {
        let mut ssh = self
            .ssh
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownHost(name.to_string()))?;

        if ssh.host.is_none() {
            ssh.host = Some(name.to_string());
        }
        if ssh.proxy.as_ref().is_some_and(|proxy| proxy.host.is_none()) {
            return Err(ConfigError::MissingProxyHost(name.to_string()));
        }

        Ok(Target {
            name: name.to_string(),
            ssh,
        })
    }

    /// Template variables, with `host` set when rendering for one host
    #[must_use]
    pub fn template_vars(&self, host: Option<&str>) -> TemplateVars {
        let mut vars = TemplateVars::new();
        if let Some(project) = &self.project {
            vars.insert("project".to_string(), project.clone());
        }
        if let Some(env) = &self.env {
            vars.insert("env".to_string(), env.clone());
        }
        if let Some(host) = host {
            vars.insert("host".to_string(), host.to_string());
        }
        vars
    }

    /// Render a list of commands for local hooks or one host
    ///
    /// # Errors
    /// Returns an error if a command references an unknown variable.
    pub fn render_commands(
        &self,
        commands: &[String],
        host: Option<&str>,
    ) -> Result<Vec<String>, ConfigError> {
        let mut vars = self.template_vars(host);
        if let Some(host) = host {
            vars.insert("remote_dir".to_string(), self.remote_dir(host)?);
        }
        commands.iter().map(|c| template::render(c, &vars)).collect()
    }

    fn remote_dir(&self, host: &str) -> Result<String, ConfigError> {
        let dir = self
            .remote
            .dir
            .as_deref()
            .ok_or(ConfigError::Missing("remote.dir"))?;
        template::render(dir, &self.template_vars(Some(host)))
    }

    /// Render every per-host template for `host`
    ///
    /// # Errors
    /// Fails if `remote.dir` is unset or a template is invalid.
    pub fn host_settings(&self, host: &str) -> Result<HostSettings, ConfigError> {
        let remote_dir = self.remote_dir(host)?;
        let mut vars = self.template_vars(Some(host));
        vars.insert("remote_dir".to_string(), remote_dir.clone());

        let compose_file = self
            .remote
            .compose_file
            .as_deref()
            .map(|t| template::render(t, &vars).map(PathBuf::from))
            .transpose()?;
        let start_command = self
            .remote
            .start_command
            .as_deref()
            .map(|t| template::render(t, &vars))
            .transpose()?;
        let after_deploy_remote = self
            .hooks
            .after_deploy_remote
            .iter()
            .map(|c| template::render(c, &vars))
            .collect::<Result<_, _>>()?;

        Ok(HostSettings {
            remote_dir,
            compose_file,
            start_command,
            after_deploy_remote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
project = "api"
env = "staging"
src_dir = "app"
build_commands = ["cargo build --release"]

[remote]
dir = "/srv/{{ project }}-{{ env }}"
compose_file = "deploy/{{ env }}.yml"
start_command = "cd {{ remote_dir }} && ./restart.sh {{ host }}"

[hooks]
pre = ["echo building {{ project }}"]
after_deploy_remote = ["ls {{ remote_dir }}"]

[ssh.web1]
user = "deploy"
private_key_file = "keys/deploy"

[ssh.web2]
host = "10.0.0.2"
port = 2222

[ssh.web2.proxy]
host = "bastion.example.com"
private_key_file = "~/.ssh/bastion"

[instances]
staging = [{ host = "web1" }, { host = "web2" }]
production = []
"#;

    fn sample() -> DeployConfig {
        let file = PartialConfig::parse(SAMPLE, Path::new("/proj")).unwrap();
        PartialConfig::defaults()
            .merge(file)
            .resolve(Path::new("/proj"))
            .unwrap()
    }

    #[test]
    fn test_parse_empty_config() {
        let config = PartialConfig::parse("", Path::new("/proj")).unwrap();
        assert_eq!(config, PartialConfig::default());
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        assert!(PartialConfig::parse("stage_nme = \"x\"", Path::new("/proj")).is_err());
    }

    #[test]
    fn test_defaults_resolve() {
        let config = PartialConfig::defaults().resolve(Path::new("/proj")).unwrap();
        assert_eq!(config.local_stage_dir(), Path::new("/proj/./stage"));
        assert_eq!(
            config.local_manifest_path(),
            Path::new("/proj/./dirDigestMap.json")
        );
        assert_eq!(config.stage_dir, Path::new("target/docker/stage"));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.remote.log_tail, 100);
        assert_eq!(config.remote.log_delay, Duration::from_secs(5));
        assert_eq!(config.connect_retries, 0);
    }

    #[test]
    fn test_resolve_without_defaults_is_missing() {
        let err = PartialConfig::default().resolve(Path::new("/proj")).unwrap_err();
        assert_eq!(err, ConfigError::Missing("src_dir"));
    }

    #[test]
    fn test_relative_paths_follow_file() {
        let config = sample();
        assert_eq!(config.src_dir, Path::new("/proj/app"));
        assert_eq!(
            config.source_stage_dir(),
            Path::new("/proj/app/target/docker/stage")
        );
        assert_eq!(
            config.ssh["web1"].private_key_file.as_deref(),
            Some(Path::new("/proj/keys/deploy"))
        );
        let proxy = config.ssh["web2"].proxy.as_ref().unwrap();
        assert_eq!(
            proxy.private_key_file.as_deref(),
            Some(Path::new("~/.ssh/bastion"))
        );
    }

    #[test]
    fn test_merge_precedence() {
        let file = PartialConfig::parse(SAMPLE, Path::new("/proj")).unwrap();
        let machine = PartialConfig::parse(
            r#"
env = "production"
[remote]
log_tail = 20
[ssh.web1]
host = "192.168.1.10"
[instances]
production = [{ host = "web1" }]
"#,
            Path::new("/etc/stagesync"),
        )
        .unwrap();
        let cli = PartialConfig {
            env: Some("staging".to_string()),
            ..PartialConfig::default()
        };

        let config = PartialConfig::defaults()
            .merge(file)
            .merge(machine)
            .merge(cli)
            .resolve(Path::new("/proj"))
            .unwrap();

        assert_eq!(config.env.as_deref(), Some("staging"));
        assert_eq!(config.remote.log_tail, 20);
        assert_eq!(config.remote.log_delay, Duration::from_secs(5));
        // ssh tables replace per name
        assert_eq!(config.ssh["web1"].host.as_deref(), Some("192.168.1.10"));
        assert_eq!(config.ssh["web1"].user, "root");
        assert_eq!(config.ssh["web2"].port, 2222);
        assert_eq!(config.instances["production"].len(), 1);
        assert_eq!(config.instances["staging"].len(), 2);
    }

    const APPS: &str = r#"
env = "production"

[common]
build_commands = ["make"]
[common.remote]
dir = "/srv/{{ project }}"
log_tail = 50
[common.instances]
production = [{ host = "web1" }]
[common.ssh.web1]
private_key_file = "keys/deploy"

[apps.api]
src_dir = "api"
[apps.api.remote]
log_tail = 10

[apps.shop]
project = "storefront"
build_commands = ["npm run build"]
"#;

    #[test]
    fn test_select_app_layers_common_then_app() {
        let file = PartialConfig::parse(APPS, Path::new("/proj")).unwrap();

        let api = PartialConfig::defaults()
            .merge(file.clone().select_app(Some("api")).unwrap())
            .resolve(Path::new("/proj"))
            .unwrap();
        assert_eq!(api.project.as_deref(), Some("api"));
        assert_eq!(api.env.as_deref(), Some("production"));
        assert_eq!(api.src_dir, Path::new("/proj/api"));
        assert_eq!(api.build_commands, vec!["make"]);
        assert_eq!(api.remote.log_tail, 10);
        assert_eq!(api.host_settings("web1").unwrap().remote_dir, "/srv/api");
        assert_eq!(
            api.ssh["web1"].private_key_file.as_deref(),
            Some(Path::new("/proj/keys/deploy"))
        );

        let shop = file.select_app(Some("shop")).unwrap();
        assert_eq!(shop.project.as_deref(), Some("storefront"));
        assert_eq!(shop.build_commands, Some(vec!["npm run build".to_string()]));
        assert_eq!(shop.remote.log_tail, Some(50));
        assert!(shop.apps.is_empty());
        assert!(shop.common.is_none());
    }

    #[test]
    fn test_select_app_errors_and_fallback() {
        let file = PartialConfig::parse(APPS, Path::new("/proj")).unwrap();
        assert_eq!(
            file.clone().select_app(Some("nope")).unwrap_err(),
            ConfigError::UnknownApp("nope".to_string())
        );

        let shared = file.select_app(None).unwrap();
        assert_eq!(shared.project, None);
        assert_eq!(shared.remote.log_tail, Some(50));

        let plain = PartialConfig::parse(SAMPLE, Path::new("/proj")).unwrap();
        assert_eq!(plain.clone().select_app(None).unwrap(), plain);
    }

    #[test]
    fn test_merge_combines_app_tables() {
        let file = PartialConfig::parse(APPS, Path::new("/proj")).unwrap();
        let machine = PartialConfig::parse(
            "[apps.api.remote]\nlog_delay_secs = 1\n[common]\nconnect_retries = 3\n",
            Path::new("/etc"),
        )
        .unwrap();

        let api = file.merge(machine).select_app(Some("api")).unwrap();
        assert_eq!(api.remote.log_tail, Some(10));
        assert_eq!(api.remote.log_delay_secs, Some(1));
        assert_eq!(api.connect_retries, Some(3));
        assert_eq!(api.build_commands, Some(vec!["make".to_string()]));
    }

    #[test]
    fn test_targets() {
        let config = sample();
        let targets = config.targets(None).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "web1");
        assert_eq!(targets[0].ssh.host.as_deref(), Some("web1"));
        assert_eq!(targets[0].ssh.user, "deploy");
        assert_eq!(targets[1].ssh.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(
            targets[1].ssh.proxy.as_ref().unwrap().host.as_deref(),
            Some("bastion.example.com")
        );

        let only = config.targets(Some("web2")).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "web2");
    }

    #[test]
    fn test_target_errors() {
        let mut config = sample();
        assert_eq!(
            config.targets(Some("web9")).unwrap_err(),
            ConfigError::HostNotInEnv {
                host: "web9".to_string(),
                env: "staging".to_string()
            }
        );

        config.env = Some("production".to_string());
        assert_eq!(
            config.targets(None).unwrap_err(),
            ConfigError::NoInstances("production".to_string())
        );

        config.env = Some("qa".to_string());
        assert_eq!(
            config.targets(None).unwrap_err(),
            ConfigError::NoInstances("qa".to_string())
        );

        config.env = None;
        assert_eq!(config.targets(None).unwrap_err(), ConfigError::Missing("env"));

        let mut config = sample();
        config.ssh.remove("web1");
        assert_eq!(
            config.targets(None).unwrap_err(),
            ConfigError::UnknownHost("web1".to_string())
        );

        let mut config = sample();
        if let Some(proxy) = config.ssh.get_mut("web2").and_then(|s| s.proxy.as_mut()) {
            proxy.host = None;
        }
        assert_eq!(
            config.targets(Some("web2")).unwrap_err(),
            ConfigError::MissingProxyHost("web2".to_string())
        );
    }

    #[test]
    fn test_host_settings_render() {
        let settings = sample().host_settings("web1").unwrap();
        assert_eq!(settings.remote_dir, "/srv/api-staging");
        assert_eq!(
            settings.compose_file.as_deref(),
            Some(Path::new("/proj/deploy/staging.yml"))
        );
        assert_eq!(
            settings.start_command.as_deref(),
            Some("cd /srv/api-staging && ./restart.sh web1")
        );
        assert_eq!(settings.after_deploy_remote, vec!["ls /srv/api-staging"]);
    }

    #[test]
    fn test_host_settings_requires_remote_dir() {
        let mut config = sample();
        config.remote.dir = None;
        assert_eq!(
            config.host_settings("web1").unwrap_err(),
            ConfigError::Missing("remote.dir")
        );
    }

    #[test]
    fn test_render_local_commands() {
        let config = sample();
        assert_eq!(
            config.render_commands(&config.hooks.pre, None).unwrap(),
            vec!["echo building api"]
        );

        let err = config
            .render_commands(&["echo {{ host }}".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVariable { .. }));
    }
}
