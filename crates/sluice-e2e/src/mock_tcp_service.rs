//! Mock TCP service for E2E tests

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Behavior mode for the mock TCP service
#[derive(Clone, Debug)]
pub enum TcpServiceMode {
    /// Echo back all received data
    Echo,
    /// Write a banner as soon as the connection opens, then echo
    Greeting(Vec<u8>),
    /// Read until the peer closes its side, then answer with the byte count
    Accumulate,
}

/// A finished connection as seen by the service
#[derive(Clone, Debug)]
pub struct RecordedTcpConnection {
    pub received_data: Vec<u8>,
    pub peer_addr: SocketAddr,
}

/// A mock TCP service for testing
pub struct MockTcpService {
    addr: SocketAddr,
    connections: Arc<RwLock<Vec<RecordedTcpConnection>>>,
    shutdown: CancellationToken,
}

impl MockTcpService {
    /// Start an echo service on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with_mode(TcpServiceMode::Echo).await
    }

    pub async fn start_with_mode(mode: TcpServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock TCP service");
        let addr = listener.local_addr().unwrap();

        let connections: Arc<RwLock<Vec<RecordedTcpConnection>>> = Arc::new(RwLock::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let connections_clone = connections.clone();
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_clone.cancelled() => {
                        tracing::debug!("Mock TCP service shutting down");
                        break;
                    }
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            let connections = connections_clone.clone();
                            let mode = mode.clone();
                            tokio::spawn(async move {
                                let received_data = handle_connection(stream, mode).await;
                                connections.write().push(RecordedTcpConnection {
                                    received_data,
                                    peer_addr,
                                });
                            });
                        }
                        Err(e) => {
                            tracing::error!("TCP accept error: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        Self {
            addr,
            connections,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Connections that have finished
    pub fn get_connections(&self) -> Vec<RecordedTcpConnection> {
        self.connections.read().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

impl Drop for MockTcpService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve one connection, returning everything it received
async fn handle_connection(mut stream: TcpStream, mode: TcpServiceMode) -> Vec<u8> {
    let mut received_data = Vec::new();
    let mut buf = [0u8; 4096];

    if let TcpServiceMode::Greeting(banner) = &mode {
        if let Err(e) = stream.write_all(banner).await {
            tracing::error!("Greeting write error: {}", e);
            return received_data;
        }
    }

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                received_data.extend_from_slice(&buf[..n]);
                if !matches!(mode, TcpServiceMode::Accumulate) {
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        tracing::error!("Echo write error: {}", e);
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Mock TCP read error: {}", e);
                break;
            }
        }
    }

    if matches!(mode, TcpServiceMode::Accumulate) {
        let summary = format!("received {} bytes", received_data.len());
        let _ = stream.write_all(summary.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    received_data
}
