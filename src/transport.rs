//! `SshTransport`: a thin adapter over `russh` (spec.md §4.2).
//!
//! The channel-opening capability is expressed as the `Transport` trait so
//! `SocksListener` and `Relay` depend on a byte-stream-producing seam rather
//! than on `russh` types directly — the same boundary the teacher draws
//! between `SshService` (owns the handshake) and the plain stream its
//! `TunnelService` copy loops read from.

use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A byte stream that can be read and written independently; returned by
/// `Transport::open_direct_tcpip`. Boxed so callers don't need to know
/// whether the stream came from a real SSH channel or a test double.
pub type BoxedStream = Box<dyn ReadWrite>;

pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ReadWrite for T {}

/// Policy hook for verifying the server's host key (spec.md §4.2, §6).
/// The default accepts any key; callers needing pinning implement this.
pub trait HostKeyPolicy: Send + Sync {
    fn accept(&self, fingerprint: &str) -> bool;
}

pub struct AcceptAnyHostKey;
impl HostKeyPolicy for AcceptAnyHostKey {
    fn accept(&self, _fingerprint: &str) -> bool {
        true
    }
}

/// The channel-opening capability every flow (`SocksListener`) and tunnel
/// (`TunnelManager`) needs from an established SSH session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_direct_tcpip(
        &self,
        dest_host: &str,
        dest_port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<BoxedStream>;

    fn is_active(&self) -> bool;

    /// Close the SSH session explicitly, rather than relying on `Drop`
    /// (spec.md §4.1's disconnect step).
    async fn disconnect(&self);
}

/// Opens and authenticates one SSH session (spec.md §4.2). Pulled out of
/// `TunnelManager` so tests can substitute a double for the real handshake
/// while still exercising the manager's retry/state logic (spec.md §8).
#[async_trait]
pub trait SessionFactory: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        compression: bool,
        sock: Option<BoxedStream>,
    ) -> Result<Arc<dyn Transport>>;
}

struct HostKeyHandler {
    policy: Arc<dyn HostKeyPolicy>,
}

impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        use russh::keys::ssh_key::HashAlg;
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let accept = self.policy.accept(&fingerprint);
        async move {
            tracing::debug!("server host key fingerprint: {}", fingerprint);
            Ok(accept)
        }
    }
}

/// An established, authenticated SSH session plus the facilities to open
/// `direct-tcpip` channels on it.
pub struct SshTransport {
    session: Handle<HostKeyHandler>,
}

impl SshTransport {
    /// Connect and authenticate with a password, per spec.md §4.2.
    ///
    /// When `sock` is present the handshake runs over that stream instead
    /// of a fresh TCP connect — the bridge-mode hook (spec.md §4.2, §9):
    /// the second hop's handshake is carried inside a `direct-tcpip`
    /// channel opened on the first hop.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        compression: bool,
        host_key_policy: Arc<dyn HostKeyPolicy>,
        sock: Option<BoxedStream>,
    ) -> Result<Self> {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            preferred: if compression {
                russh::Preferred::COMPRESSED
            } else {
                russh::Preferred::default()
            },
            ..<client::Config as Default>::default()
        };

        let handler = HostKeyHandler {
            policy: host_key_policy,
        };

        let connect_result = match sock {
            Some(stream) => {
                tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    client::connect_stream(Arc::new(config), stream, handler),
                )
                .await
            }
            None => {
                tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    client::connect(Arc::new(config), (host, port), handler),
                )
                .await
            }
        };

        let mut session = connect_result
            .map_err(|_| TunnelError::TransportError("SSH handshake timed out".to_string()))?
            .map_err(|e| TunnelError::TransportError(e.to_string()))?;

        let auth = session
            .authenticate_password(user, password)
            .await
            .map_err(|e| TunnelError::TransportError(e.to_string()))?;

        if !matches!(auth, AuthResult::Success) {
            return Err(TunnelError::AuthFailed(format!(
                "password authentication rejected for {}@{}:{}",
                user, host, port
            )));
        }

        tracing::info!("authenticated SSH session to {}@{}:{}", user, host, port);
        Ok(Self { session })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_direct_tcpip(
        &self,
        dest_host: &str,
        dest_port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<BoxedStream> {
        let channel: Channel<Msg> = self
            .session
            .channel_open_direct_tcpip(dest_host, dest_port as u32, originator_host, originator_port as u32)
            .await
            .map_err(|e| TunnelError::ChannelOpenFailed {
                host: dest_host.to_string(),
                port: dest_port,
                cause: e.to_string(),
            })?;

        let stream: ChannelStream<Msg> = channel.into_stream();
        Ok(Box::new(stream))
    }

    fn is_active(&self) -> bool {
        !self.session.is_closed()
    }

    async fn disconnect(&self) {
        if let Err(e) = self.session.disconnect(russh::Disconnect::ByApplication, "", "en").await {
            tracing::debug!("error disconnecting SSH session: {}", e);
        }
    }
}

/// The production `SessionFactory`: opens a real, authenticated SSH session
/// via `SshTransport::connect` under the host-key policy it was built with.
pub struct RusshSessionFactory {
    host_key_policy: Arc<dyn HostKeyPolicy>,
}

impl RusshSessionFactory {
    pub fn new(host_key_policy: Arc<dyn HostKeyPolicy>) -> Self {
        Self { host_key_policy }
    }
}

#[async_trait]
impl SessionFactory for RusshSessionFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        compression: bool,
        sock: Option<BoxedStream>,
    ) -> Result<Arc<dyn Transport>> {
        let transport = SshTransport::connect(host, port, user, password, compression, self.host_key_policy.clone(), sock).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_any_host_key_always_true() {
        let policy = AcceptAnyHostKey;
        assert!(policy.accept("anything"));
    }
}
