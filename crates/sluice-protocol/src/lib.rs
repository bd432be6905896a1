//! Control wire protocol shared by the Sluice server and client.
//!
//! Every control exchange is one JSON request line followed by one JSON
//! response line on a dedicated stream of the multiplexed session.

mod codec;
mod error;
mod messages;

pub use codec::{CodecError, ControlCodec, MAX_CONTROL_MESSAGE_BYTES};
pub use error::{ControlError, ErrorKind};
pub use messages::{
    ControlRequest, HeaderKv, HttpTunnelRequest, HttpTunnelResponse, RawControlRequest,
    TcpTunnelRequest, TcpTunnelResponse, TunnelType,
};

/// Path of the control endpoint on the server's public listener
pub const CONTROL_PATH: &str = "/control";

/// Token sent in the `Upgrade` header when opening a control connection
pub const UPGRADE_PROTOCOL: &str = "sluice-mux/1";
