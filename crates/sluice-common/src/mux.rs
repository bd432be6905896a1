//! Stream multiplexing over a single control connection.
//!
//! [`MuxSession`] wraps a tokio-yamux session. The yamux state machine is
//! polled by a dedicated driver task which hands inbound streams to an
//! accept queue; callers only see `open_stream`, `accept_stream` and `close`.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_yamux::session::SessionType;
use tokio_yamux::{Config as YamuxConfig, Control, Session};

use crate::TunnelError;

/// A virtual stream opened over a [`MuxSession`]
pub type MuxStream = tokio_yamux::StreamHandle;

/// Inbound streams buffered before the driver starts refusing them
const ACCEPT_BACKLOG: usize = 256;

/// Which side of the multiplexed connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Handle to a multiplexed session; clones share the same session
#[derive(Clone)]
pub struct MuxSession {
    inner: Arc<Inner>,
}

struct Inner {
    control: parking_lot::Mutex<Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    closed: CancellationToken,
}

impl MuxSession {
    /// Start a session over `io` and spawn its driver task
    pub fn new<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session_type = match role {
            Role::Client => SessionType::Client,
            Role::Server => SessionType::Server,
        };
        let mut session = Session::new(io, YamuxConfig::default(), session_type);
        let control = session.control();

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let closed = CancellationToken::new();
        let driver_closed = closed.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = driver_closed.cancelled() => break,
                    next = session.next() => match next {
                        Some(Ok(stream)) => {
                            if let Err(e) = tx.try_send(stream) {
                                tracing::warn!("Dropping inbound stream: {}", e);
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!("Multiplexed session error: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            // Dropping the session here closes the underlying connection
            driver_closed.cancel();
            tracing::debug!("Multiplexed session ({:?}) closed", role);
        });

        Self {
            inner: Arc::new(Inner {
                control: parking_lot::Mutex::new(control),
                incoming: tokio::sync::Mutex::new(rx),
                closed,
            }),
        }
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> Result<MuxStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }
        let mut control = self.inner.control.lock().clone();

        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(TunnelError::ConnectionClosed),
            result = control.open_stream() => {
                result.map_err(|e| TunnelError::Mux(format!("open stream: {}", e)))
            }
        }
    }

    /// Wait for the next stream opened by the peer
    ///
    /// Fails with [`TunnelError::ConnectionClosed`] once the session is gone.
    pub async fn accept_stream(&self) -> Result<MuxStream, TunnelError> {
        let mut incoming = self.inner.incoming.lock().await;

        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(TunnelError::ConnectionClosed),
            stream = incoming.recv() => stream.ok_or(TunnelError::ConnectionClosed),
        }
    }

    /// Close the session and its underlying connection; idempotent
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the session has been closed by either side
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (MuxSession, MuxSession) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            MuxSession::new(a, Role::Client),
            MuxSession::new(b, Role::Server),
        )
    }

    #[tokio::test]
    async fn test_open_and_accept_stream() {
        let (client, server) = pair();

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"hello").await.unwrap();
        outbound.flush().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.unwrap();
        inbound.flush().await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let (client, server) = pair();

        let accept = tokio::spawn({
            let server = server.clone();
            async move { server.accept_stream().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();

        let result = tokio::time::timeout(Duration::from_secs(1), accept)
            .await
            .expect("accept did not unblock")
            .unwrap();
        assert!(matches!(result, Err(TunnelError::ConnectionClosed)));
        assert!(server.is_closed());

        // The peer observes the connection going away
        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("peer session did not close");
        assert!(client.open_stream().await.is_err());
    }
}
