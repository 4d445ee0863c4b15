//! `TunnelManager`: top-level orchestration (spec.md §4.1), grounded in
//! `original_source/tunnel.py`'s `TunnelManager` and the teacher's
//! `services/session_manager.rs` for the mutex-guarded-state shape.

use crate::config::{Mode, TunnelConfig};
use crate::diagnoser::{self, Diagnosis};
use crate::error::{Result, TunnelError};
use crate::process_hygiene::{self, PortGuard, PortState};
use crate::proxy_adapter::{NoopProxyRegistrar, ProxyRegistrar};
use crate::socks::{self, SocksListenerHandle};
use crate::traffic::{TrafficCounters, TrafficMonitor, TrafficSample};
use crate::transport::{AcceptAnyHostKey, HostKeyPolicy, RusshSessionFactory, SessionFactory, Transport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// The manager's internal state machine. `Established` carries everything
/// that must be torn down together on `disconnect`.
enum SessionState {
    Idle,
    Established {
        /// The egress-side session: the only session in direct mode, or the
        /// destination session in bridge mode (its handshake rode a channel
        /// opened on `_hop2`).
        hop1: Arc<dyn Transport>,
        /// Present only in bridge mode: the relay session `hop1`'s
        /// handshake was carried over — must outlive the channel it opened.
        _hop2: Option<Arc<dyn Transport>>,
        /// Released on `disconnect`, freeing `local_port` for a subsequent
        /// `connect()` in this same process.
        _port_guard: PortGuard,
        socks: SocksListenerHandle,
        monitor: TrafficMonitor,
        #[allow(dead_code)]
        counters: TrafficCounters,
        started_at: DateTime<Utc>,
    },
}

/// A snapshot of tunnel status safe to hand to a UI layer.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub local_port: Option<u16>,
    pub traffic: Option<TrafficSample>,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct TunnelManager {
    state: Mutex<SessionState>,
    session_factory: Arc<dyn SessionFactory>,
    proxy_registrar: Arc<dyn ProxyRegistrar>,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            session_factory: Arc::new(RusshSessionFactory::new(Arc::new(AcceptAnyHostKey))),
            proxy_registrar: Arc::new(NoopProxyRegistrar),
        }
    }

    pub fn with_host_key_policy(mut self, policy: Arc<dyn HostKeyPolicy>) -> Self {
        self.session_factory = Arc::new(RusshSessionFactory::new(policy));
        self
    }

    /// Swap in a different session factory — the seam integration tests use
    /// to exercise the retry/state logic below without a live SSH server
    /// (spec.md §4.8, §8).
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = factory;
        self
    }

    pub fn with_proxy_registrar(mut self, registrar: Arc<dyn ProxyRegistrar>) -> Self {
        self.proxy_registrar = registrar;
        self
    }

    /// Establish the tunnel described by `cfg`. Retries transient
    /// transport failures up to `MAX_RETRIES` times with a fixed linear
    /// backoff; auth/config failures fail immediately, per spec.md §4.1.
    ///
    /// Holds the state lock for the whole attempt sequence, including
    /// backoff sleeps, so a concurrent `disconnect()` can't observe `Idle`,
    /// return early, and then have this call land in `Established` after
    /// the caller believed the tunnel was torn down — the two are mutually
    /// exclusive for the lock's entire lifetime, not just around each
    /// individual transition.
    ///
    /// Returns once the SOCKS front-end is already accepting connections.
    pub async fn connect(&self, cfg: &TunnelConfig) -> Result<()> {
        cfg.validate()?;

        let mut guard = self.state.lock().await;
        if matches!(*guard, SessionState::Established { .. }) {
            return Err(TunnelError::AlreadyConnected);
        }

        if process_hygiene::probe_local_port(cfg.local_port).await == PortState::InUse {
            tracing::warn!(
                "local_port {} appears to be in use; proceeding anyway, the real bind will surface the conflict",
                cfg.local_port
            );
        }

        let mut last_err = None;
        for attempt in 1..=MAX_RETRIES {
            match self.try_connect_once(cfg).await {
                Ok(established) => {
                    *guard = established;
                    return Ok(());
                }
                Err(e) => {
                    let diagnosis = diagnoser::analyze(&e.to_string());
                    tracing::warn!(
                        "connection attempt {}/{} failed: {} ({:?})",
                        attempt,
                        MAX_RETRIES,
                        e,
                        diagnosis.category
                    );
                    let transient = e.is_transient();
                    last_err = Some(e);
                    if !transient || attempt == MAX_RETRIES {
                        break;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TunnelError::TransportError("connection failed".to_string())))
    }

    async fn try_connect_once(&self, cfg: &TunnelConfig) -> Result<SessionState> {
        let counters = TrafficCounters::new();

        let (active_hop, relay_hop): (Arc<dyn Transport>, Option<Arc<dyn Transport>>) = match cfg.mode {
            Mode::Direct => {
                tracing::info!("connecting direct to {}:{}", cfg.hop1.host, cfg.hop1.port);
                let hop1 = self
                    .session_factory
                    .connect(&cfg.hop1.host, cfg.hop1.port, &cfg.hop1.user, &cfg.hop1.password, cfg.compression, None)
                    .await?;
                (hop1, None)
            }
            Mode::Bridge => {
                tracing::info!("connecting via relay {}:{}", cfg.hop1.host, cfg.hop1.port);
                let relay = self
                    .session_factory
                    .connect(&cfg.hop1.host, cfg.hop1.port, &cfg.hop1.user, &cfg.hop1.password, cfg.compression, None)
                    .await?;

                tracing::info!(
                    "relay connected, bridging to destination {}:{}",
                    cfg.hop2.host,
                    cfg.hop2.port
                );
                let bridge_stream = relay.open_direct_tcpip(&cfg.hop2.host, cfg.hop2.port, "localhost", 0).await?;

                let destination = self
                    .session_factory
                    .connect(
                        &cfg.hop2.host,
                        cfg.hop2.port,
                        &cfg.hop2.user,
                        &cfg.hop2.password,
                        cfg.compression,
                        Some(bridge_stream),
                    )
                    .await?;

                (destination, Some(relay))
            }
        };

        let transport = active_hop.clone();

        let port_guard = PortGuard::claim(cfg.local_port)?;
        let socks = socks::start(cfg.local_port, transport, counters.clone()).await?;
        let monitor = TrafficMonitor::start(counters.clone());

        self.proxy_registrar.enable(cfg.local_port).await;

        Ok(SessionState::Established {
            hop1: active_hop,
            _hop2: relay_hop,
            _port_guard: port_guard,
            socks,
            monitor,
            counters,
            started_at: Utc::now(),
        })
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        if let SessionState::Established {
            hop1,
            _hop2: hop2,
            socks,
            mut monitor,
            ..
        } = std::mem::replace(&mut *guard, SessionState::Idle)
        {
            socks.shutdown().await;
            monitor.stop();

            // spec.md §4.1: close SSH sessions egress first, then relay.
            hop1.disconnect().await;
            if let Some(hop2) = hop2 {
                hop2.disconnect().await;
            }

            self.proxy_registrar.disable().await;
            tracing::info!("tunnel disconnected");
        }
        Ok(())
    }

    pub async fn is_established(&self) -> bool {
        matches!(&*self.state.lock().await, SessionState::Established { hop1, .. } if hop1.is_active())
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let guard = self.state.lock().await;
        match &*guard {
            SessionState::Idle => StatusSnapshot {
                connected: false,
                local_port: None,
                traffic: None,
                started_at: None,
            },
            SessionState::Established {
                socks,
                monitor,
                hop1,
                started_at,
                ..
            } => StatusSnapshot {
                connected: hop1.is_active(),
                local_port: Some(socks.local_addr().port()),
                traffic: Some(monitor.sample().await),
                started_at: Some(*started_at),
            },
        }
    }

    pub fn diagnose(error_message: &str) -> Diagnosis {
        diagnoser::analyze(error_message)
    }
}
