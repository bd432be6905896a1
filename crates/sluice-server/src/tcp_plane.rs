use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sluice_common::{proxy_bidirectional, MuxSession, ProxyStats, TunnelError};
use sluice_protocol::{ControlError, ErrorKind};

/// Public listeners for TCP tunnels
pub struct TcpPlane {
    bind_addr: IpAddr,
    port_range: (u16, u16),
}

impl TcpPlane {
    pub fn new(bind_addr: IpAddr, port_range: (u16, u16)) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            port_range,
        })
    }

    pub fn with_default_bind(port_range: (u16, u16)) -> Arc<Self> {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port_range)
    }

    /// Configured range, or an error when it is unusable
    pub fn port_range(&self) -> Result<(u16, u16), ControlError> {
        let (start, end) = self.port_range;
        if start == 0 || end == 0 || end < start {
            return Err(ControlError::with_message(
                ErrorKind::InvalidRequest,
                "invalid tcp port range",
            ));
        }
        Ok((start, end))
    }

    /// Reject a requested port outside the configured range
    pub fn check_requested(&self, port: u16) -> Result<(), ControlError> {
        let (start, end) = self.port_range()?;
        if port < start || port > end {
            return Err(ControlError::with_message(
                ErrorKind::InvalidRequest,
                "requested port out of range",
            ));
        }
        Ok(())
    }

    /// Bind the public listener for `port`
    pub async fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::new(self.bind_addr, port)).await
    }

    /// Forward every inbound connection onto a fresh stream toward the client
    ///
    /// Returns once `cancel` fires or the session closes; the listener is
    /// dropped with it.
    pub async fn serve(
        &self,
        listener: TcpListener,
        session: MuxSession,
        port: u16,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = session.closed() => break,
                accepted = listener.accept() => accepted,
            };

            let (inbound, peer_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("TCP accept error on port {}: {}", port, e);
                    break;
                }
            };
            let _ = inbound.set_nodelay(true);
            tracing::debug!("TCP connection from {} on port {}", peer_addr, port);

            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let stream = match session.open_stream().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!("Failed to open stream for {}: {}", peer_addr, e);
                        return;
                    }
                };

                let stats = ProxyStats::new();
                match proxy_bidirectional(&cancel, inbound, stream, &stats).await {
                    Ok(()) | Err(TunnelError::Cancelled) => {}
                    Err(e) => tracing::debug!("TCP bridge for {} ended: {}", peer_addr, e),
                }
                tracing::debug!(
                    "TCP connection from {} closed ({} bytes in, {} bytes out)",
                    peer_addr,
                    stats.a_to_b(),
                    stats.b_to_a()
                );
            });
        }

        drop(listener);
        tracing::info!("TCP listener on port {} closed", port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_validation() {
        assert!(TcpPlane::with_default_bind((20000, 20010)).port_range().is_ok());

        let inverted = TcpPlane::with_default_bind((20010, 20000));
        assert_eq!(
            inverted.port_range().unwrap_err().message,
            "invalid tcp port range"
        );
        assert!(TcpPlane::with_default_bind((0, 10)).port_range().is_err());
    }

    #[test]
    fn test_requested_port_must_be_in_range() {
        let plane = TcpPlane::with_default_bind((20000, 20010));
        assert!(plane.check_requested(20000).is_ok());
        assert!(plane.check_requested(20010).is_ok());

        let err = plane.check_requested(20011).unwrap_err();
        assert_eq!(err.message, "requested port out of range");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_bind_reports_busy_port() {
        let plane = TcpPlane::new("127.0.0.1".parse().unwrap(), (1, 65535));
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        assert!(plane.bind(port).await.is_err());
        drop(held);
        assert!(plane.bind(port).await.is_ok());
    }
}
