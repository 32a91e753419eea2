//! SSH transport implementation using russh
//!
//! Every remote operation is a shell command on its own session channel, so
//! one connection serves many concurrent operations. Servers cap how many
//! session channels a connection may hold open (OpenSSH `MaxSessions`
//! defaults to 10), so channels are handed out through a semaphore.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail, eyre};
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use stagesync_core::remote::{local_mode, shell_quote};
use stagesync_core::{CommandOutput, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{Auth, Endpoint};

/// Session channels one connection keeps open at a time
pub const MAX_SESSION_CHANNELS: usize = 8;

/// How long `close` waits for the session to wind down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts or verifies the server's host key
pub struct HostKeyPolicy {
    host: String,
    port: u16,
    verify: bool,
}

impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = key.fingerprint(HashAlg::Sha256);
        if !self.verify {
            debug!(host = %self.host, %fingerprint, "accepting server key");
            return Ok(true);
        }

        match russh::keys::check_known_hosts(&self.host, self.port, key) {
            Ok(true) => {
                debug!(host = %self.host, %fingerprint, "server key matches known_hosts");
                Ok(true)
            }
            Ok(false) => {
                warn!(host = %self.host, %fingerprint, "server key not in known_hosts");
                Ok(false)
            }
            Err(err) => {
                warn!(host = %self.host, %fingerprint, "server key rejected: {err}");
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH connection to one host
pub struct SshSession {
    host: String,
    handle: Handle<HostKeyPolicy>,
    channels: Semaphore,
}

impl SshSession {
    /// Connect to an endpoint over TCP and authenticate
    ///
    /// # Errors
    /// Returns an error on network or authentication failure, or when the
    /// handshake exceeds `timeout`.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        info!("Connecting to {endpoint}");
        let handshake = async {
            let handle = client::connect(
                client_config(),
                (endpoint.host.as_str(), endpoint.port),
                HostKeyPolicy::for_endpoint(endpoint),
            )
            .await?;
            Self::authenticate(endpoint, handle).await
        };

        with_timeout(endpoint, timeout, handshake).await
    }

    /// Run the SSH protocol over an already open stream, such as a tunnel
    ///
    /// # Errors
    /// Returns an error on handshake or authentication failure, or timeout.
    pub async fn connect_stream<S>(endpoint: &Endpoint, stream: S, timeout: Duration) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = async {
            let handle =
                client::connect_stream(client_config(), stream, HostKeyPolicy::for_endpoint(endpoint))
                    .await?;
            Self::authenticate(endpoint, handle).await
        };

        with_timeout(endpoint, timeout, handshake).await
    }

    async fn authenticate(endpoint: &Endpoint, mut handle: Handle<HostKeyPolicy>) -> Result<Self> {
        let result = match &endpoint.auth {
            Auth::Password(password) => {
                handle
                    .authenticate_password(&endpoint.user, password)
                    .await?
            }
            Auth::InlineKey(material) => {
                let key = russh::keys::decode_secret_key(material, None)
                    .wrap_err("failed to decode inline private key")?;
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                handle
                    .authenticate_publickey(
                        &endpoint.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await?
            }
            Auth::KeyFile(path) => {
                let key = russh::keys::load_secret_key(path, None)
                    .wrap_err_with(|| format!("failed to load private key {}", path.display()))?;
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                handle
                    .authenticate_publickey(
                        &endpoint.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await?
            }
        };

        if !result.success() {
            bail!("authentication failed for {endpoint}");
        }

        info!("Connected to {endpoint}");
        Ok(Self {
            host: endpoint.host.clone(),
            handle,
            channels: Semaphore::new(MAX_SESSION_CHANNELS),
        })
    }

    /// Open a raw TCP tunnel from this server to `host:port`
    ///
    /// # Errors
    /// Returns an error if the server refuses the forward.
    pub async fn open_tunnel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static> {
        debug!(host = %self.host, "opening tunnel to {host}:{port}");
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .wrap_err_with(|| format!("{} refused a tunnel to {host}:{port}", self.host))?;
        Ok(channel.into_stream())
    }

    /// Disconnect from the server and wait for the session to end
    ///
    /// Once this returns, nothing more is written to the underlying stream.
    ///
    /// # Errors
    /// Returns an error if the disconnect message cannot be sent.
    pub async fn close(self) -> Result<()> {
        let Self { host, handle, .. } = self;
        debug!(%host, "disconnecting");
        handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .wrap_err_with(|| format!("failed to disconnect from {host}"))?;

        match tokio::time::timeout(CLOSE_TIMEOUT, handle).await {
            Ok(ended) => debug!(%host, "session ended: {ended:?}"),
            Err(_) => warn!(
                %host,
                "session still running {}s after disconnect",
                CLOSE_TIMEOUT.as_secs()
            ),
        }
        Ok(())
    }

    /// Run a command, optionally streaming `stdin` into it
    async fn run_with_input<R>(&self, command: &str, stdin: Option<R>) -> Result<CommandOutput>
    where
        R: AsyncRead + Unpin + Send,
    {
        debug!(host = %self.host, "$ {command}");
        // Held until the channel is closed
        let _permit = self.channels.acquire().await?;
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        if let Some(input) = stdin {
            channel.data(input).await?;
        }
        channel.eof().await?;

        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    output.stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_code = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    output.signal = Some(format!("{signal_name:?}"));
                }
                _ => {}
            }
        }

        Ok(output)
    }
}

impl HostKeyPolicy {
    fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            verify: endpoint.verify_host_key,
        }
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config::default())
}

async fn with_timeout<F>(endpoint: &Endpoint, timeout: Duration, handshake: F) -> Result<SshSession>
where
    F: Future<Output = Result<SshSession>>,
{
    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| eyre!("timed out connecting to {endpoint} after {}s", timeout.as_secs()))?
        .wrap_err_with(|| format!("failed to connect to {endpoint}"))
}

#[async_trait]
impl Transport for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.run_with_input(command, None::<tokio::io::Empty>).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let output = self.run(&format!("test -f {}", shell_quote(path))).await?;
        Ok(output.success())
    }

    async fn dir_exists(&self, path: &str) -> Result<bool> {
        let output = self.run(&format!("test -d {}", shell_quote(path))).await?;
        Ok(output.success())
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        self.exec(&format!("mkdir -p {}", shell_quote(path))).await?;
        Ok(())
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.exec(&format!("chmod {mode:o} {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mode = local_mode(local).await?;
        let file = tokio::fs::File::open(local)
            .await
            .wrap_err_with(|| format!("failed to open {}", local.display()))?;

        let quoted = shell_quote(remote);
        let command = format!("cat > {quoted} && chmod {mode:o} {quoted}");
        self.run_with_input(&command, Some(file))
            .await?
            .check(&command)?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let output = self.exec(&format!("cat {}", shell_quote(path))).await?;
        Ok(output.stdout)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.exec(&format!("rm -f {}", shell_quote(path))).await?;
        Ok(())
    }
}
