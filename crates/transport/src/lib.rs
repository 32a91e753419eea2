//! stagesync-transport: Remote transports for the sync engine
//!
//! Handles SSH connections (direct or tunneled through a proxy host) and a
//! local transport that runs against the local filesystem.

pub mod connection;
pub mod local;
pub mod ssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use stagesync_core::SshHostConfig;

pub use connection::{Connection, TunneledSession};
pub use local::LocalTransport;
pub use ssh::SshSession;

/// Key file used when a host configures no credentials
pub const DEFAULT_KEY_FILE: &str = "~/.ssh/id_rsa";

/// How to authenticate to one SSH server
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Private key material given inline
    InlineKey(String),
    /// Private key read from a file
    KeyFile(PathBuf),
    Password(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InlineKey(_) => f.write_str("InlineKey(..)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Address and credentials for one SSH server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
    /// Require the server key to be listed in `~/.ssh/known_hosts`
    pub verify_host_key: bool,
}

impl Endpoint {
    /// Build an endpoint from host settings, picking credentials in order:
    /// inline key, key file, password, then the default key file.
    ///
    /// # Errors
    /// Returns an error if no host is set or `~` cannot be expanded.
    pub fn from_config(config: &SshHostConfig) -> Result<Self> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| eyre!("ssh settings have no host"))?;

        let auth = if let Some(key) = &config.private_key {
            Auth::InlineKey(key.clone())
        } else if let Some(path) = &config.private_key_file {
            Auth::KeyFile(expand_home(path)?)
        } else if let Some(password) = &config.password {
            Auth::Password(password.clone())
        } else {
            Auth::KeyFile(expand_home(Path::new(DEFAULT_KEY_FILE))?)
        };

        Ok(Self {
            host,
            port: config.port,
            user: config.user.clone(),
            auth,
            verify_host_key: config.verify_host_key,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Whether to connect straight to the target or hop through a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Direct(Endpoint),
    Proxied { target: Endpoint, proxy: Endpoint },
}

impl ConnectionSpec {
    /// # Errors
    /// Returns an error if the target or proxy settings are incomplete.
    pub fn from_config(config: &SshHostConfig) -> Result<Self> {
        let target = Endpoint::from_config(config)?;
        match &config.proxy {
            Some(proxy) => Ok(Self::Proxied {
                target,
                proxy: Endpoint::from_config(proxy)?,
            }),
            None => Ok(Self::Direct(target)),
        }
    }

    #[must_use]
    pub fn target(&self) -> &Endpoint {
        match self {
            Self::Direct(target) | Self::Proxied { target, .. } => target,
        }
    }
}

/// Connection establishment settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Limit on each SSH handshake and authentication
    pub timeout: Duration,
    /// Extra attempts after a failed connect
    pub retries: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 0,
        }
    }
}

/// Expand a leading `~` to the user's home directory
///
/// # Errors
/// Returns an error if the path starts with `~` and no home directory is known.
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().ok_or_else(|| eyre!("cannot determine home directory"))?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}
