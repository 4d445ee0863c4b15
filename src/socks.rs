//! `SocksListener`: the SOCKS5 front-end (spec.md §4.3).
//!
//! CONNECT-only, NO-AUTH, loopback-only, per spec.md §6. Every accepted
//! client is handled in its own task; the accept loop never blocks on
//! per-flow work and closes every client socket on all error paths.

use crate::error::{Result, TunnelError};
use crate::relay;
use crate::traffic::TrafficCounters;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_HOST_UNREACHABLE: [u8; 10] = [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_COMMAND_NOT_SUPPORTED: [u8; 10] = [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: [u8; 10] = [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

const GRACE_WINDOW: Duration = Duration::from_secs(5);

/// A running SOCKS5 listener. Dropping or calling `shutdown` closes the
/// accepting socket; in-flight flows get a bounded grace window to drain
/// before being severed.
pub struct SocksListenerHandle {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    shutdown: Arc<Notify>,
    flows: Arc<tokio::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl SocksListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the accept socket, then wait up to `GRACE_WINDOW` for
    /// in-flight flows to finish before aborting the stragglers.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.accept_task.await;

        let mut flows = self.flows.lock().await;
        let pending = std::mem::take(&mut *flows);
        drop(flows);

        let drain = async {
            for handle in &pending {
                // JoinHandle doesn't support "wait without consuming", so we
                // poll is_finished in a loop rather than awaiting by value.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        };

        if tokio::time::timeout(GRACE_WINDOW, drain).await.is_err() {
            tracing::warn!("grace window elapsed, severing remaining SOCKS flows");
        }
        for handle in pending {
            handle.abort();
        }
    }
}

/// Bind `127.0.0.1:local_port` and start accepting. Returns once the
/// listener is bound and the accept loop is running, so callers (namely
/// `TunnelManager::connect`) can rely on the service being available the
/// instant this returns, per spec.md §4.3.
pub async fn start(local_port: u16, transport: Arc<dyn Transport>, counters: TrafficCounters) -> Result<SocksListenerHandle> {
    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|e| TunnelError::TransportError(format!("failed to bind 127.0.0.1:{}: {}", local_port, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    let flows = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let flows_for_loop = flows.clone();

    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_signal.notified() => {
                    tracing::info!("SOCKS listener on {} shutting down", local_addr);
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let transport = transport.clone();
                            let counters = counters.clone();
                            let handle = tokio::spawn(async move {
                                if let Err(e) = handle_flow(stream, peer, transport, counters).await {
                                    tracing::debug!("SOCKS flow from {} ended: {}", peer, e);
                                }
                            });
                            flows_for_loop.lock().await.push(handle);
                        }
                        Err(e) => {
                            tracing::error!("SOCKS accept error: {}", e);
                        }
                    }
                }
            }
        }
    });

    tracing::info!("SOCKS5 listener accepting on {}", local_addr);
    Ok(SocksListenerHandle {
        local_addr,
        accept_task,
        shutdown,
        flows,
    })
}

enum Handshake {
    Connect { host: String, port: u16 },
    Rejected,
}

async fn handle_flow(
    mut stream: TcpStream,
    peer: SocketAddr,
    transport: Arc<dyn Transport>,
    counters: TrafficCounters,
) -> Result<()> {
    // Correlates the handshake, channel-open and relay log lines for one
    // flow without having to thread the peer address through every call.
    let flow_id = Uuid::new_v4();

    let handshake = match negotiate(&mut stream).await {
        Ok(h) => h,
        Err(e) => {
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    let (dest_host, dest_port) = match handshake {
        Handshake::Connect { host, port } => (host, port),
        Handshake::Rejected => {
            let _ = stream.shutdown().await;
            return Ok(());
        }
    };

    tracing::debug!("[{}] SOCKS flow {} -> {}:{}", flow_id, peer, dest_host, dest_port);

    let channel = match transport
        .open_direct_tcpip(&dest_host, dest_port, &peer.ip().to_string(), peer.port())
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!("[{}] channel open to {}:{} failed: {}", flow_id, dest_host, dest_port, e);
            let _ = stream.write_all(&REPLY_HOST_UNREACHABLE).await;
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    stream
        .write_all(&REPLY_SUCCESS)
        .await
        .map_err(TunnelError::Io)?;

    tracing::debug!("[{}] relay starting", flow_id);
    relay::run(stream, channel, counters).await;
    tracing::debug!("[{}] relay finished", flow_id);
    Ok(())
}

async fn negotiate(stream: &mut TcpStream) -> Result<Handshake> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.map_err(TunnelError::Io)?;
    if header[0] != SOCKS_VERSION {
        return Err(TunnelError::SocksProtocolError(format!(
            "unsupported SOCKS version {}",
            header[0]
        )));
    }

    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await.map_err(TunnelError::Io)?;

    stream.write_all(&[SOCKS_VERSION, 0x00]).await.map_err(TunnelError::Io)?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await.map_err(TunnelError::Io)?;
    if request[0] != SOCKS_VERSION {
        return Err(TunnelError::SocksProtocolError(format!(
            "unsupported SOCKS version {} in request",
            request[0]
        )));
    }

    if request[1] != CMD_CONNECT {
        stream.write_all(&REPLY_COMMAND_NOT_SUPPORTED).await.map_err(TunnelError::Io)?;
        return Ok(Handshake::Rejected);
    }

    let atyp = request[3];
    let dest_host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await.map_err(TunnelError::Io)?;
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await.map_err(TunnelError::Io)?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut domain).await.map_err(TunnelError::Io)?;
            String::from_utf8_lossy(&domain).to_string()
        }
        ATYP_IPV6 => {
            stream.write_all(&REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await.map_err(TunnelError::Io)?;
            return Ok(Handshake::Rejected);
        }
        other => {
            return Err(TunnelError::SocksProtocolError(format!(
                "unsupported address type {}",
                other
            )));
        }
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await.map_err(TunnelError::Io)?;
    let dest_port = u16::from_be_bytes(port_buf);

    Ok(Handshake::Connect {
        host: dest_host,
        port: dest_port,
    })
}
