//! Sluice tunnel server library
//!
//! This library provides the core components for running a sluice tunnel server.
//! It can be used to embed a tunnel server in other applications or for testing.

mod config;
mod control_plane;
mod http_plane;
mod limits;
mod policy;
mod rate_limit;
mod registry;
mod router;
mod store;
mod tcp_plane;

// Re-export public types
pub use config::{ResolvedServerConfig, ServerConfig, TlsFiles, TokenConfig};
pub use control_plane::{Collaborators, ControlPlane, ControlSettings, CONTROL_STREAM_TIMEOUT};
pub use http_plane::{HttpPlane, HttpSettings, ProxyBody};
pub use limits::{ConcurrencyLimiter, TunnelSlot};
pub use policy::{AccessPolicy, BasicAuthCredential, PolicyError};
pub use rate_limit::{Clock, RateLimiter};
pub use registry::{
    generate_id, BoxedStream, HttpTunnelEntry, RegistryError, StreamOpener, TunnelRegistry,
    TunnelStream,
};
pub use router::{normalize_domain, request_client_ip, tunnel_id_from_host};
pub use store::{MemoryStore, ReservationStore, StoreError, TokenId, TokenResolver, TokenValidator};
pub use tcp_plane::TcpPlane;
