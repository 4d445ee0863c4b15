//! `RemoteExec`: run a single shell script on a remote host over its own
//! SSH session (spec.md §5), grounded in `original_source/doctor.py`'s
//! `_run_remote_script`, which shells out to `bash -c <script>` in one
//! `exec_command` call rather than a multi-command session.

use crate::error::{Result, TunnelError};
use crate::transport::{AcceptAnyHostKey, HostKeyPolicy};
use async_trait::async_trait;
use russh::client::{self, AuthResult};
use russh::ChannelMsg;
use std::sync::Arc;
use std::time::Duration;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const BANNER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

/// The capability `Remediator` needs from a remote host: run one script,
/// get back its combined output. Abstracted so `Remediator` can be tested
/// with a scripted fake instead of a real SSH-reachable box.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run_script(&self, script: &str) -> Result<ExecOutput>;
}

struct AcceptingHandler {
    policy: Arc<dyn HostKeyPolicy>,
}

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        use russh::keys::ssh_key::HashAlg;
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let accept = self.policy.accept(&fingerprint);
        async move { Ok(accept) }
    }
}

/// Opens its own SSH session per call — the repair path runs rarely and
/// independently of the data-plane tunnel, so it doesn't borrow the
/// broker's existing `SshTransport`.
pub struct SshRemoteExec {
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl SshRemoteExec {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl RemoteExec for SshRemoteExec {
    async fn run_script(&self, script: &str) -> Result<ExecOutput> {
        let config = client::Config {
            inactivity_timeout: Some(BANNER_TIMEOUT),
            ..<client::Config as Default>::default()
        };
        let handler = AcceptingHandler {
            policy: Arc::new(AcceptAnyHostKey),
        };

        let mut session = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            client::connect(Arc::new(config), (self.host.as_str(), self.port), handler),
        )
        .await
        .map_err(|_| TunnelError::TransportError("remote-exec SSH handshake timed out".to_string()))?
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;

        let auth = session
            .authenticate_password(&self.user, &self.password)
            .await
            .map_err(|e| TunnelError::TransportError(e.to_string()))?;
        if !matches!(auth, AuthResult::Success) {
            return Err(TunnelError::AuthFailed(format!(
                "remote-exec auth rejected for {}@{}:{}",
                self.user, self.host, self.port
            )));
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::TransportError(e.to_string()))?;

        // Single bash -c invocation, matching the original remediator's
        // one-shot exec_command per repair phase.
        let command = format!("bash -c {}", shell_quote(script));
        channel
            .exec(true, command)
            .await
            .map_err(|e| TunnelError::TransportError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }

        let _ = channel.close().await;
        let _ = session.disconnect(russh::Disconnect::ByApplication, "", "en").await;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_status,
        })
    }
}

/// Wrap `script` in single quotes for use as the argument to `bash -c`,
/// escaping embedded single quotes the POSIX-shell way (`'"'"'`).
fn shell_quote(script: &str) -> String {
    format!("'{}'", script.replace('\'', r#"'"'"'"#))
}
