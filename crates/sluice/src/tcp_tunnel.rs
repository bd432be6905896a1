//! TCP tunnels: a public port on the server, bridged stream by stream.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use sluice_common::{proxy_bidirectional, ControlEndpoint, MuxSession, MuxStream, ProxyStats, TunnelError};
use sluice_protocol::TcpTunnelRequest;

use crate::control::request_tcp_tunnel;
use crate::tunnel::{TunnelDriver, TunnelHandle};

/// How to open a TCP tunnel
#[derive(Debug, Clone, Default)]
pub struct TcpTunnelOptions {
    pub authtoken: String,
    /// Public port to ask for (0 = let the server pick)
    pub remote_port: u16,
}

struct TcpDriver {
    local_addr: String,
    authtoken: String,
    remote_port: u16,
}

#[async_trait]
impl TunnelDriver for TcpDriver {
    type Identity = u16;

    async fn establish(
        &self,
        session: &MuxSession,
        previous: Option<&u16>,
    ) -> Result<u16, TunnelError> {
        let request = TcpTunnelRequest {
            authtoken: self.authtoken.clone(),
            remote_port: previous.copied().unwrap_or(self.remote_port),
        };
        request_tcp_tunnel(session, request).await
    }

    async fn handle_stream(&self, stream: MuxStream, cancel: CancellationToken) {
        let local = match TcpStream::connect(&self.local_addr).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!("Failed to connect to local service {}: {}", self.local_addr, e);
                return;
            }
        };
        let _ = local.set_nodelay(true);

        let stats = ProxyStats::new();
        match proxy_bidirectional(&cancel, stream, local, &stats).await {
            Ok(()) | Err(TunnelError::Cancelled) => {}
            Err(e) => tracing::debug!("Connection to {} ended with error: {}", self.local_addr, e),
        }
        tracing::debug!(
            "Connection to {} closed ({} bytes in, {} bytes out)",
            self.local_addr,
            stats.a_to_b(),
            stats.b_to_a()
        );
    }
}

/// A running TCP tunnel
///
/// When the connection to the server drops, the tunnel reconnects and asks
/// for the port it already holds. Being handed a different port ends the
/// tunnel with [`TunnelError::ResumeMismatch`].
pub struct TcpTunnel {
    local_addr: String,
    handle: TunnelHandle<TcpDriver>,
}

impl TcpTunnel {
    pub async fn start(
        endpoint: ControlEndpoint,
        local_addr: impl Into<String>,
        options: TcpTunnelOptions,
        cancel: &CancellationToken,
    ) -> Result<Self, TunnelError> {
        let local_addr = local_addr.into();
        let driver = TcpDriver {
            local_addr: local_addr.clone(),
            authtoken: options.authtoken,
            remote_port: options.remote_port,
        };

        let handle = TunnelHandle::start(endpoint, driver, true, cancel).await?;
        tracing::info!(
            "TCP tunnel established: port {} -> {}",
            handle.core().identity(),
            local_addr
        );

        Ok(Self { local_addr, handle })
    }

    /// Public port on the server
    pub fn remote_port(&self) -> u16 {
        self.handle.core().identity()
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub async fn wait(&mut self) -> Result<(), TunnelError> {
        self.handle.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use sluice_common::Role;

    #[tokio::test]
    async fn test_stream_bridged_to_local_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = socket.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });

        let driver = TcpDriver {
            local_addr,
            authtoken: String::new(),
            remote_port: 0,
        };
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::new(a, Role::Client);
        let server = MuxSession::new(b, Role::Server);

        let mut public = server.open_stream().await.unwrap();
        public.write_all(b"echo me").await.unwrap();
        public.flush().await.unwrap();

        let stream = client.accept_stream().await.unwrap();
        tokio::spawn(async move {
            driver.handle_stream(stream, CancellationToken::new()).await;
        });

        let mut buf = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(2), public.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"echo me");
    }
}
