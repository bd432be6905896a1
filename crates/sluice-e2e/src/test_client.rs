//! Test client for E2E tests
//!
//! Wraps the real sluice client so tests drive exactly what users run.
//! Dropping a client closes its tunnel.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sluice::{HttpTunnel, HttpTunnelOptions, TcpTunnel, TcpTunnelOptions};
use sluice_common::{ControlEndpoint, TunnelError};
use sluice_protocol::HttpTunnelRequest;

enum Tunnel {
    Http(HttpTunnel),
    Tcp(TcpTunnel),
}

/// A running tunnel client
pub struct TestClient {
    tunnel: Tunnel,
    cancel: CancellationToken,
}

/// HTTP options carrying only an authtoken
pub fn http_options(authtoken: &str) -> HttpTunnelOptions {
    HttpTunnelOptions {
        request: HttpTunnelRequest {
            authtoken: authtoken.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

impl TestClient {
    /// Open an HTTP tunnel forwarding to `local_addr`
    pub async fn http(
        endpoint: ControlEndpoint,
        local_addr: &str,
        options: HttpTunnelOptions,
    ) -> Result<Self, TunnelError> {
        let cancel = CancellationToken::new();
        let tunnel = HttpTunnel::start(endpoint, local_addr, options, &cancel).await?;
        tracing::debug!("Test HTTP tunnel {} -> {}", tunnel.url(), local_addr);
        Ok(Self {
            tunnel: Tunnel::Http(tunnel),
            cancel,
        })
    }

    /// Open a TCP tunnel forwarding to `local_addr`
    pub async fn tcp(
        endpoint: ControlEndpoint,
        local_addr: &str,
        authtoken: &str,
        remote_port: u16,
    ) -> Result<Self, TunnelError> {
        let cancel = CancellationToken::new();
        let options = TcpTunnelOptions {
            authtoken: authtoken.to_string(),
            remote_port,
        };
        let tunnel = TcpTunnel::start(endpoint, local_addr, options, &cancel).await?;
        tracing::debug!("Test TCP tunnel :{} -> {}", tunnel.remote_port(), local_addr);
        Ok(Self {
            tunnel: Tunnel::Tcp(tunnel),
            cancel,
        })
    }

    /// Tunnel id of an HTTP tunnel (the first label of its host)
    pub fn tunnel_id(&self) -> Option<String> {
        match &self.tunnel {
            Tunnel::Http(tunnel) => Some(tunnel.id()),
            Tunnel::Tcp(_) => None,
        }
    }

    /// Public URL of an HTTP tunnel
    pub fn url(&self) -> Option<String> {
        match &self.tunnel {
            Tunnel::Http(tunnel) => Some(tunnel.url()),
            Tunnel::Tcp(_) => None,
        }
    }

    /// Public port of a TCP tunnel
    pub fn tcp_port(&self) -> Option<u16> {
        match &self.tunnel {
            Tunnel::Http(_) => None,
            Tunnel::Tcp(tunnel) => Some(tunnel.remote_port()),
        }
    }

    /// Wait at most `timeout` for the tunnel to end
    ///
    /// `None` means it was still running.
    pub async fn wait_for(&mut self, timeout: Duration) -> Option<Result<(), TunnelError>> {
        let wait = async {
            match &mut self.tunnel {
                Tunnel::Http(tunnel) => tunnel.wait().await,
                Tunnel::Tcp(tunnel) => tunnel.wait().await,
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
