//! Sluice tunnel client.
//!
//! [`HttpTunnel`] and [`TcpTunnel`] dial a sluice server, ask for a tunnel
//! and bridge every stream the server opens to a local address.

mod capture;
mod config;
mod control;
mod host_rewrite;
mod http_tunnel;
mod tcp_tunnel;
mod tunnel;

pub use capture::{
    CapturedExchange, ExchangeRecorder, ExchangeTaps, LogRecorder, PreviewBuffer, RecentExchanges,
    TapReader, DEFAULT_PREVIEW_BYTES,
};
pub use config::{
    normalize_local_addr, parse_http_upstream, ClientConfig, HttpUpstream, InvalidUpstream,
    ResolvedClientConfig, UpstreamScheme,
};
pub use control::{
    dial_control_with_retry, request_http_tunnel, request_tcp_tunnel, INITIAL_BACKOFF, MAX_BACKOFF,
};
pub use host_rewrite::{copy_with_host_rewrite, rewrite_head, HostHeader, InvalidHostHeader, MAX_HEAD_BYTES};
pub use http_tunnel::{HttpIdentity, HttpTunnel, HttpTunnelOptions};
pub use tcp_tunnel::{TcpTunnel, TcpTunnelOptions};

pub use sluice_common::{ControlEndpoint, TunnelError};
pub use sluice_protocol::{HeaderKv, HttpTunnelRequest};
