//! Integration tests for `TunnelManager`.
//!
//! Full connect-over-SSH tests require a reachable SSH server and are out
//! of scope here; these focus on the config validation, lifecycle, and
//! diagnosis paths that don't need one.

use socks_ssh_broker::config::{HopSpec, Mode, TunnelConfig};
use socks_ssh_broker::manager::TunnelManager;

fn base_config() -> TunnelConfig {
    TunnelConfig {
        mode: Mode::Direct,
        hop1: HopSpec {
            host: "127.0.0.1".into(),
            port: 22,
            user: "u".into(),
            password: "p".into(),
        },
        hop2: HopSpec::default(),
        local_port: 18080,
        compression: false,
    }
}

#[tokio::test]
async fn idle_manager_reports_disconnected() {
    let manager = TunnelManager::new();
    let snapshot = manager.snapshot().await;
    assert!(!snapshot.connected);
    assert!(snapshot.local_port.is_none());
    assert!(snapshot.traffic.is_none());
}

#[tokio::test]
async fn connect_with_missing_hop1_host_fails_validation() {
    let manager = TunnelManager::new();
    let mut cfg = base_config();
    cfg.hop1.host = String::new();

    let result = manager.connect(&cfg).await;
    assert!(result.is_err());
    assert!(!manager.is_established().await);
}

#[tokio::test]
async fn connect_with_bridge_mode_missing_hop2_fails_validation() {
    let manager = TunnelManager::new();
    let mut cfg = base_config();
    cfg.mode = Mode::Bridge;

    let result = manager.connect(&cfg).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn connect_with_out_of_range_local_port_fails_validation() {
    let manager = TunnelManager::new();
    let mut cfg = base_config();
    cfg.local_port = 80;

    let result = manager.connect(&cfg).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn disconnect_without_a_prior_connect_is_harmless() {
    let manager = TunnelManager::new();
    assert!(manager.disconnect().await.is_ok());
}

#[tokio::test]
async fn diagnose_classifies_a_refused_connection_as_fixable_network() {
    let diagnosis = TunnelManager::diagnose("Connection refused");
    assert!(diagnosis.fixable);
}
