//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use lit_proxy::{Protocol, ProxyConfig, ProxyServer, Shutdown, TcpConnector};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Echo server for a single connection. The receiver fires once the
/// proxied connection has been closed by the proxy.
pub async fn start_echo_server() -> (SocketAddr, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = socket.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = writer.shutdown().await;
        let _ = closed_tx.send(());
    });

    (addr, closed_rx)
}

/// Server that answers every request head it sees with `response` and
/// reports everything it read once its connection ends.
pub async fn start_recording_server(
    response: &'static [u8],
) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut answered = 0;
        let mut chunk = [0u8; 4096];
        loop {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.extend_from_slice(&chunk[..n]),
            }
            let heads = count_heads(&seen);
            while answered < heads {
                if socket.write_all(response).await.is_err() {
                    break;
                }
                answered += 1;
            }
        }
        let _ = seen_tx.send(seen);
    });

    (addr, seen_rx)
}

fn count_heads(bytes: &[u8]) -> usize {
    bytes.windows(4).filter(|w| w == b"\r\n\r\n").count()
}

/// A proxy running on ephemeral loopback ports.
pub struct TestProxy {
    pub socks5: SocketAddr,
    pub http: SocketAddr,
    shutdown: Arc<Shutdown>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn spawn_proxy(configure: impl FnOnce(&mut ProxyConfig)) -> TestProxy {
    let mut config = ProxyConfig::default();
    config.socks5.bind_address = "127.0.0.1:0".into();
    config.http.bind_address = "127.0.0.1:0".into();
    configure(&mut config);

    let server = ProxyServer::bind(&config, Arc::new(TcpConnector::new()))
        .await
        .unwrap();
    let socks5 = server.local_addr(Protocol::Socks5).unwrap();
    let http = server.local_addr(Protocol::Http).unwrap();

    let shutdown = Arc::new(Shutdown::new());
    let stop = Arc::clone(&shutdown);
    tokio::spawn(async move { server.run(&stop).await });

    TestProxy {
        socks5,
        http,
        shutdown,
    }
}

/// Read from `stream` until `needle` has been seen, returning everything read.
pub async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut chunk = [0u8; 1024];
    while !seen.windows(needle.len()).any(|w| w == needle) {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for data")
            .unwrap();
        assert!(n > 0, "connection closed before {:?} arrived", String::from_utf8_lossy(needle));
        seen.extend_from_slice(&chunk[..n]);
    }
    seen
}

/// Read until the peer closes, returning everything read.
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut seen = Vec::new();
    // A reset still counts as closed; keep whatever arrived before it.
    let _ = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut seen))
        .await
        .expect("timed out waiting for close");
    seen
}
