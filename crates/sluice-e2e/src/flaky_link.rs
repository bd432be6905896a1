//! A TCP relay between client and server that can drop its connections
//!
//! Clients dial the link instead of the server. [`FlakyLink::sever`] closes
//! every connection relayed so far, which looks to both ends like the
//! network went away; new connections are relayed as usual.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use sluice_common::ControlEndpoint;

pub struct FlakyLink {
    addr: SocketAddr,
    /// Cancelled by `sever`, then replaced for later connections
    generation: Arc<Mutex<CancellationToken>>,
    accepted: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl FlakyLink {
    /// Relay connections to `target` from an ephemeral local port
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind flaky link");
        let addr = listener.local_addr().unwrap();

        let generation = Arc::new(Mutex::new(CancellationToken::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let generation_clone = generation.clone();
        let accepted_clone = accepted.clone();
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let inbound = tokio::select! {
                    _ = shutdown_clone.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::error!("Flaky link accept error: {}", e);
                            break;
                        }
                    },
                };
                accepted_clone.fetch_add(1, Ordering::Relaxed);
                let cut = generation_clone.lock().clone();
                let stop = shutdown_clone.clone();
                tokio::spawn(relay(inbound, target, cut, stop));
            }
        });

        Self {
            addr,
            generation,
            accepted,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Control endpoint routed through the link
    pub fn endpoint(&self) -> ControlEndpoint {
        ControlEndpoint::parse(&format!("http://{}", self.addr)).expect("Invalid link URL")
    }

    /// Drop every connection relayed so far
    pub fn sever(&self) {
        let previous = std::mem::replace(&mut *self.generation.lock(), CancellationToken::new());
        previous.cancel();
        tracing::debug!("Flaky link on {} severed", self.addr);
    }

    /// Connections accepted since the link started
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl Drop for FlakyLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.generation.lock().cancel();
    }
}

async fn relay(
    mut inbound: TcpStream,
    target: SocketAddr,
    cut: CancellationToken,
    stop: CancellationToken,
) {
    let mut outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Flaky link failed to reach {}: {}", target, e);
            return;
        }
    };

    // Dropping both sockets on cut resets the connection at both ends
    tokio::select! {
        _ = cut.cancelled() => {}
        _ = stop.cancelled() => {}
        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
    }
}
