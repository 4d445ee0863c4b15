//! Tunnel configuration: the read-only-during-a-session data model of spec.md §3.
//!
//! JSON I/O is a thin external collaborator (`load_from_str` / `load_from_path`);
//! the core only ever consumes the validated `TunnelConfig` view.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[serde(rename = "1_hop")]
    Direct,
    #[serde(rename = "2_hop")]
    Bridge,
}

/// A single SSH hop: `{host, port, user, password}`.
///
/// `port` is accepted from JSON as either a number or a numeric string
/// (the original config format stores ports as strings) and parsed to an
/// integer at load time, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HopSpec {
    #[serde(rename = "ip", default)]
    pub host: String,
    #[serde(default, deserialize_with = "port_from_string_or_number")]
    pub port: u16,
    #[serde(rename = "user", default)]
    pub user: String,
    #[serde(rename = "pass", default)]
    pub password: String,
}

fn port_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::Text(s) if s.is_empty() => Ok(0),
        PortValue::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl HopSpec {
    fn is_complete(&self) -> bool {
        !self.host.is_empty() && self.port >= 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub mode: Mode,
    #[serde(default)]
    pub hop1: HopSpec,
    #[serde(default)]
    pub hop2: HopSpec,
    pub local_port: u16,
    #[serde(default)]
    pub compression: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Direct,
            hop1: HopSpec::default(),
            hop2: HopSpec::default(),
            local_port: 1080,
            compression: false,
        }
    }
}

impl TunnelConfig {
    /// Validate the invariants of spec.md §3: in bridge mode both hops must
    /// be complete; in direct mode hop2 is ignored; `local_port` in
    /// `[1024, 65535]`.
    pub fn validate(&self) -> Result<()> {
        if !(1024..=65535).contains(&self.local_port) {
            return Err(TunnelError::ConfigMissing(format!(
                "local_port {} out of range [1024, 65535]",
                self.local_port
            )));
        }

        if !self.hop1.is_complete() {
            return Err(TunnelError::ConfigMissing("hop1.ip / hop1.port".to_string()));
        }

        if matches!(self.mode, Mode::Bridge) && !self.hop2.is_complete() {
            return Err(TunnelError::ConfigMissing("hop2.ip / hop2.port".to_string()));
        }

        Ok(())
    }
}

/// Load a configuration from a JSON string, falling back to defaults on
/// missing/corrupt input (the on-disk document is an external collaborator;
/// the broker only needs a validated in-memory view).
pub fn load_from_str(contents: &str) -> TunnelConfig {
    serde_json::from_str(contents).unwrap_or_else(|e| {
        tracing::warn!("config is missing or corrupt, using defaults: {}", e);
        TunnelConfig::default()
    })
}

pub async fn load_from_path(path: impl AsRef<Path>) -> TunnelConfig {
    match tokio::fs::read_to_string(path.as_ref()).await {
        Ok(contents) => load_from_str(&contents),
        Err(e) => {
            tracing::warn!(
                "could not read config file {:?}, using defaults: {}",
                path.as_ref(),
                e
            );
            TunnelConfig::default()
        }
    }
}
