//! Direct and proxied connections with a single teardown path

use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use stagesync_core::retry::retry;
use tracing::warn;

use crate::ssh::SshSession;
use crate::{ConnectOptions, ConnectionSpec, Endpoint};

/// A target session reached through a tunnel on a proxy session
///
/// The proxy session carries the target's traffic, so it is closed only
/// after the target.
pub struct TunneledSession {
    target: SshSession,
    parent: SshSession,
}

impl TunneledSession {
    /// Connect to `proxy`, tunnel to `target`, and authenticate over the tunnel
    ///
    /// If anything fails after the proxy session is up, the proxy session
    /// is closed before the error is returned.
    ///
    /// # Errors
    /// Returns an error if either connection or the tunnel fails.
    pub async fn open(target: &Endpoint, proxy: &Endpoint, options: &ConnectOptions) -> Result<Self> {
        let parent = SshSession::connect(proxy, options.timeout).await?;

        let hop = async {
            let stream = parent.open_tunnel(&target.host, target.port).await?;
            SshSession::connect_stream(target, stream, options.timeout).await
        };

        match hop.await {
            Ok(target) => Ok(Self { target, parent }),
            Err(err) => {
                if let Err(close_err) = parent.close().await {
                    warn!("failed to close proxy {proxy}: {close_err:#}");
                }
                Err(err.wrap_err(format!("failed to reach {target} through {proxy}")))
            }
        }
    }

    #[must_use]
    pub fn target(&self) -> &SshSession {
        &self.target
    }

    /// Close the target session, then the proxy session
    ///
    /// Both are always attempted; the first error is returned.
    ///
    /// # Errors
    /// Returns an error if either disconnect fails.
    pub async fn close(self) -> Result<()> {
        let target = self.target.close().await;
        let parent = self.parent.close().await;
        target.and(parent)
    }
}

/// A live connection to a deploy target
pub enum Connection {
    Direct(SshSession),
    Tunneled(TunneledSession),
}

impl Connection {
    /// Establish a connection, retrying up to `options.retries` times
    ///
    /// # Errors
    /// Returns the last connection error once every attempt has failed.
    pub async fn open(spec: &ConnectionSpec, options: &ConnectOptions) -> Result<Self> {
        retry(options.retries, options.timeout / 10, || Self::open_once(spec, options)).await
    }

    async fn open_once(spec: &ConnectionSpec, options: &ConnectOptions) -> Result<Self> {
        match spec {
            ConnectionSpec::Direct(target) => {
                Ok(Self::Direct(SshSession::connect(target, options.timeout).await?))
            }
            ConnectionSpec::Proxied { target, proxy } => Ok(Self::Tunneled(
                TunneledSession::open(target, proxy, options).await?,
            )),
        }
    }

    /// The session that reaches the deploy target
    #[must_use]
    pub fn transport(&self) -> &SshSession {
        match self {
            Self::Direct(session) => session,
            Self::Tunneled(tunneled) => tunneled.target(),
        }
    }

    /// Tear down every session this connection owns
    ///
    /// # Errors
    /// Returns an error if a disconnect fails.
    pub async fn close(self) -> Result<()> {
        match self {
            Self::Direct(session) => session.close().await,
            Self::Tunneled(tunneled) => tunneled.close().await,
        }
        .wrap_err("failed to close connection")
    }
}
