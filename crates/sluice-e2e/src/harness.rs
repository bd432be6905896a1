//! Test server harness for E2E tests
//!
//! Starts a complete sluice server on an ephemeral port: the HTTP plane
//! accepts both control upgrades and tunnel traffic, and TCP tunnels bind
//! inside a port range unique to each server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sluice_common::ControlEndpoint;
use sluice_server::{
    Collaborators, ControlPlane, ControlSettings, HttpPlane, HttpSettings, MemoryStore, TcpPlane,
    TokenId, TunnelRegistry,
};

/// Global counter for allocating unique port ranges to each test server
static PORT_RANGE_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Number of ports per test server
const PORTS_PER_SERVER: u16 = 10;

/// Base port for TCP plane allocations
const BASE_TCP_PORT: u16 = 51000;

/// Knobs for a test server
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    pub tunnel_domain: String,
    /// Authtokens known to the in-memory store, with their identities
    pub tokens: Vec<(String, TokenId)>,
    /// Use the store for token validation, identities and reservations
    pub use_store: bool,
    /// Static token checked when the store is not used
    pub auth_token: Option<String>,
    pub max_tunnels_per_token: i64,
    pub max_creates_per_minute: i64,
    pub trust_proxy_headers: bool,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            tunnel_domain: "tunnel.test".to_string(),
            tokens: vec![
                ("test-token".to_string(), 1),
                ("other-token".to_string(), 2),
            ],
            use_store: true,
            auth_token: None,
            max_tunnels_per_token: 0,
            max_creates_per_minute: 0,
            trust_proxy_headers: false,
        }
    }
}

/// A running test server instance
pub struct TestServer {
    /// Address of the HTTP plane (control upgrades and tunnel traffic)
    pub http_addr: SocketAddr,
    pub tunnel_domain: String,
    /// First and last port TCP tunnels may use
    pub tcp_port_range: (u16, u16),
    /// Token store shared with the control plane
    pub store: Arc<MemoryStore>,
    pub control: Arc<ControlPlane>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a test server with the default options
    pub async fn start() -> Self {
        Self::start_with(TestServerOptions::default()).await
    }

    pub async fn start_with(options: TestServerOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        for (token, id) in &options.tokens {
            store.add_token(token.clone(), *id);
        }

        let collaborators = if options.use_store {
            Collaborators {
                validator: Some(store.clone()),
                resolver: Some(store.clone()),
                reservations: Some(store.clone()),
            }
        } else {
            Collaborators::default()
        };

        // Allocate a unique port range for this test server
        let range_index = PORT_RANGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let start_port = BASE_TCP_PORT + (range_index * PORTS_PER_SERVER);
        let tcp_port_range = (start_port, start_port + PORTS_PER_SERVER - 1);
        let tcp_plane = TcpPlane::new(IpAddr::V4(Ipv4Addr::LOCALHOST), tcp_port_range);

        let shutdown = CancellationToken::new();
        let control = ControlPlane::new(
            ControlSettings {
                tunnel_domain: options.tunnel_domain.clone(),
                auth_token: options.auth_token.clone(),
                max_tunnels_per_token: options.max_tunnels_per_token,
                max_creates_per_minute: options.max_creates_per_minute,
            },
            collaborators,
            TunnelRegistry::new(),
            tcp_plane,
            shutdown.clone(),
        );

        let http_plane = HttpPlane::new(
            control.clone(),
            HttpSettings {
                tunnel_domain: options.tunnel_domain.clone(),
                trust_proxy_headers: options.trust_proxy_headers,
            },
            None,
            shutdown.clone(),
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP plane");
        let http_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Err(e) = http_plane.run_with_listener(listener).await {
                tracing::error!("HTTP plane error: {}", e);
            }
        });

        Self {
            http_addr,
            tunnel_domain: options.tunnel_domain,
            tcp_port_range,
            store,
            control,
            shutdown,
        }
    }

    /// Control URL clients dial (e.g. "http://127.0.0.1:12345")
    pub fn control_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    pub fn endpoint(&self) -> ControlEndpoint {
        ControlEndpoint::parse(&self.control_url()).expect("Invalid control URL")
    }

    /// Get the Host header value for a tunnel id
    pub fn host_for(&self, id: &str) -> String {
        format!("{}.{}", id, self.tunnel_domain)
    }

    /// Get the public URL the server hands out for a tunnel id
    pub fn url_for(&self, id: &str) -> String {
        format!("https://{}", self.host_for(id))
    }

    /// Number of live HTTP tunnels
    pub fn http_tunnel_count(&self) -> usize {
        self.control.registry().len()
    }

    /// Shutdown the test server
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
