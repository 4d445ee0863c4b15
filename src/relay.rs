//! `Relay`: bidirectional copy between a local socket and an SSH channel
//! (spec.md §4.4).

use crate::traffic::TrafficCounters;
use crate::transport::BoxedStream;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const BUFFER_SIZE: usize = 32 * 1024;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Copy bytes between `client` and `channel` until either side reports EOF,
/// an error, or no progress is made on either side for `IDLE_TIMEOUT`.
///
/// Always closes both the client socket and the channel on exit and
/// suppresses secondary errors during cleanup, per spec.md §4.4. Errors
/// encountered mid-flow are logged and contained to this flow — they never
/// propagate to the caller, which is why this returns `()`.
pub async fn run(mut client: TcpStream, mut channel: BoxedStream, counters: TrafficCounters) {
    let (mut client_rd, mut client_wr) = client.split();
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut channel_buf = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            result = tokio::time::timeout(IDLE_TIMEOUT, client_rd.read(&mut client_buf)) => {
                match result {
                    Ok(Ok(0)) => {
                        tracing::debug!("relay: client EOF");
                        break;
                    }
                    Ok(Ok(n)) => {
                        if let Err(e) = channel.write_all(&client_buf[..n]).await {
                            tracing::debug!("relay: channel write error: {}", e);
                            break;
                        }
                        counters.add_tx(n as u64);
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("relay: client read error: {}", e);
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("relay: idle timeout (client side)");
                        break;
                    }
                }
            }
            result = tokio::time::timeout(IDLE_TIMEOUT, channel.read(&mut channel_buf)) => {
                match result {
                    Ok(Ok(0)) => {
                        tracing::debug!("relay: channel EOF");
                        break;
                    }
                    Ok(Ok(n)) => {
                        if let Err(e) = client_wr.write_all(&channel_buf[..n]).await {
                            tracing::debug!("relay: client write error: {}", e);
                            break;
                        }
                        counters.add_rx(n as u64);
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("relay: channel read error: {}", e);
                        break;
                    }
                    Err(_) => {
                        tracing::debug!("relay: idle timeout (channel side)");
                        break;
                    }
                }
            }
        }
    }

    let _ = channel.shutdown().await;
    let _ = client.shutdown().await;
    tracing::debug!("relay: flow closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::TrafficCounters;
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn copies_bytes_both_directions_and_closes_on_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hello from client").await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let (channel_side, mut test_side) = duplex(1024);

        let counters = TrafficCounters::new();
        let relay_task = tokio::spawn(run(server_stream, Box::new(channel_side), counters.clone()));

        let mut from_client = vec![0u8; 64];
        let n = test_side.read(&mut from_client).await.unwrap();
        from_client.truncate(n);
        assert_eq!(&from_client, b"hello from client");

        test_side.write_all(b"hello from egress").await.unwrap();
        test_side.shutdown().await.unwrap();

        let received_by_client = client_task.await.unwrap();
        assert_eq!(&received_by_client, b"hello from egress");

        relay_task.await.unwrap();
        let (tx, rx, total) = counters.totals();
        assert!(tx > 0 && rx > 0);
        assert_eq!(total, tx + rx);
    }
}
