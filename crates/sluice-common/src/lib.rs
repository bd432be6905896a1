mod error;
mod mux;
mod proxy;
mod tls;
mod transport;

pub use error::TunnelError;
pub use mux::{MuxSession, MuxStream, Role};
pub use proxy::{copy_counted, proxy_bidirectional, proxy_with, ProxyStats};
pub use tls::{
    load_client_config, load_client_config_from_pem, load_server_config,
    load_server_config_from_pem, upstream_client_config,
};
pub use transport::{dial_control, is_control_upgrade, ControlEndpoint};
