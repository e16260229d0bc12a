pub mod pool;

use async_trait::async_trait;
use russh::client;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel has not been opened")]
    NotOpen,
    #[error("authentication failed for user {user}")]
    AuthFailed { user: String },
    #[error("invalid address {0}, expected host:port")]
    InvalidAddress(String),
    #[error("no tunnels currently open, were the targets able to accept an ssh key for user {user}?")]
    NoTunnels { user: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected health check response: {0}")]
    HealthCheckResponse(String),
    #[error("{0}")]
    Ssh(#[from] russh::Error),
    #[error("{0}")]
    Key(#[from] russh::keys::Error),
    #[error("{0}")]
    IO(#[from] std::io::Error),
}

/// A byte stream carried inside a tunnel.
pub trait TunnelConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelConn for T {}

/// A persistent outbound connection that can multiplex dials to remote
/// host:port targets.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn open(&self) -> Result<(), TunnelError>;
    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn TunnelConn>, TunnelError>;
    async fn close(&self) -> Result<(), TunnelError>;
}

struct TunnelHandler;

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An SSH connection to one remote host; dials become direct-tcpip channels.
pub struct SshTunnel {
    user: String,
    key_file: String,
    host: String,
    ssh_port: u16,
    handle: Mutex<Option<client::Handle<TunnelHandler>>>,
}

impl SshTunnel {
    pub fn new(user: &str, key_file: &str, host: &str) -> SshTunnel {
        SshTunnel {
            user: user.to_string(),
            key_file: key_file.to_string(),
            host: host.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn open(&self) -> Result<(), TunnelError> {
        let key_file = shellexpand::tilde(&self.key_file).to_string();
        let key = load_secret_key(&key_file, None)?;

        let config = Arc::new(client::Config::default());
        let mut handle =
            client::connect(config, (self.host.as_str(), self.ssh_port), TunnelHandler).await?;

        let rsa_hash = handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
            .authenticate_publickey(
                self.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
            )
            .await?;
        if !auth.success() {
            return Err(TunnelError::AuthFailed {
                user: self.user.clone(),
            });
        }

        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn TunnelConn>, TunnelError> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or(TunnelError::NotOpen)?;
        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        let handle = self.handle.lock().await.take().ok_or(TunnelError::NotOpen)?;
        handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// Seam for injecting tunnel doubles in tests.
#[async_trait]
pub trait TunnelCreator: Send + Sync {
    async fn create(
        &self,
        user: &str,
        key_file: &str,
        address: &str,
    ) -> Result<Arc<dyn Tunnel>, TunnelError>;
}

pub struct SshTunnelCreator {}

#[async_trait]
impl TunnelCreator for SshTunnelCreator {
    async fn create(
        &self,
        user: &str,
        key_file: &str,
        address: &str,
    ) -> Result<Arc<dyn Tunnel>, TunnelError> {
        let host = host_of(address);
        if host.is_empty() {
            return Err(TunnelError::InvalidAddress(address.to_string()));
        }
        Ok(Arc::new(SshTunnel::new(user, key_file, host)))
    }
}

/// The host part of a `host:port` address; addresses without a port are
/// returned whole.
pub fn host_of(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}

pub fn split_host_port(address: &str) -> Result<(String, u16), TunnelError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::InvalidAddress(address.to_string()))?;
    if host.is_empty() {
        return Err(TunnelError::InvalidAddress(address.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| TunnelError::InvalidAddress(address.to_string()))?;
    Ok((host.to_string(), port))
}
