use thiserror::Error;

/// Error kinds surfaced by the tunnel broker.
///
/// `TransportError` is the only retryable kind (see `manager::RETRY_ATTEMPTS`);
/// `AuthFailed` and `ConfigMissing` are always terminal.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("configuration is missing required fields: {0}")]
    ConfigMissing(String),

    #[error("SSH authentication failed: {0}")]
    AuthFailed(String),

    #[error("SSH transport error: {0}")]
    TransportError(String),

    #[error("malformed SOCKS request: {0}")]
    SocksProtocolError(String),

    #[error("failed to open channel to {host}:{port}: {cause}")]
    ChannelOpenFailed {
        host: String,
        port: u16,
        cause: String,
    },

    #[error("remediation phase '{phase}' failed: {stderr}")]
    RemediationFailed { phase: String, stderr: String },

    #[error("tunnel is already connected")]
    AlreadyConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Whether `TunnelManager::connect` should retry after this error.
    ///
    /// Only transport-level failures are transient; everything else
    /// (bad config, rejected credentials, protocol errors) will fail the
    /// same way on the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, TunnelError::TransportError(_) | TunnelError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(TunnelError::TransportError("refused".into()).is_transient());
    }

    #[test]
    fn auth_and_config_errors_are_terminal() {
        assert!(!TunnelError::AuthFailed("bad password".into()).is_transient());
        assert!(!TunnelError::ConfigMissing("hop1.ip".into()).is_transient());
    }
}
