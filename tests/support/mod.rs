//! Test doubles shared across the tunnel broker's integration tests,
//! matching SPEC_FULL.md §4.8/§4.12's commitment to a `Transport` double
//! (`LoopbackTransport`) and a failure-injectable `SessionFactory` double
//! for exercising `TunnelManager`'s retry policy without a live SSH server.

use async_trait::async_trait;
use socks_ssh_broker::error::Result;
use socks_ssh_broker::transport::{BoxedStream, SessionFactory, Transport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;

/// A `Transport` double that opens real loopback TCP connections in place
/// of an SSH `direct-tcpip` channel, so SOCKS-to-relay data flow can be
/// exercised without a reachable SSH server.
#[derive(Default)]
pub struct LoopbackTransport {
    opens: AtomicUsize,
}

impl LoopbackTransport {
    /// How many times `open_direct_tcpip` has been called on this session.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open_direct_tcpip(
        &self,
        dest_host: &str,
        dest_port: u16,
        _originator_host: &str,
        _originator_port: u16,
    ) -> Result<BoxedStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect((dest_host, dest_port))
            .await
            .map_err(socks_ssh_broker::error::TunnelError::Io)?;
        Ok(Box::new(stream))
    }

    fn is_active(&self) -> bool {
        true
    }

    async fn disconnect(&self) {}
}

/// A `SessionFactory` double whose `connect` outcomes are scripted ahead of
/// time: `Ok(transport)` opens a session, `Err(e)` simulates a failed
/// handshake. Once the script is exhausted, further calls succeed with a
/// fresh `LoopbackTransport` — lets tests script only the attempts they
/// care about.
pub struct ScriptedSessionFactory {
    responses: Mutex<Vec<Result<Arc<dyn Transport>>>>,
    attempts: AtomicUsize,
    sock_presence: Mutex<Vec<bool>>,
}

impl ScriptedSessionFactory {
    pub fn new(responses: Vec<Result<Arc<dyn Transport>>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            attempts: AtomicUsize::new(0),
            sock_presence: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Whether `sock` was `Some` on each successive call, in call order —
    /// used to confirm a bridge-mode destination handshake rode the relay's
    /// channel rather than opening a fresh TCP connection.
    pub fn sock_presence(&self) -> Vec<bool> {
        self.sock_presence.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessionFactory {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        _user: &str,
        _password: &str,
        _compression: bool,
        sock: Option<BoxedStream>,
    ) -> Result<Arc<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.sock_presence.lock().unwrap().push(sock.is_some());

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(Arc::new(LoopbackTransport::default()))
        } else {
            responses.remove(0)
        }
    }
}
