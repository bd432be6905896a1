use sluice_protocol::{CodecError, ControlError};
use thiserror::Error;

/// Common errors for tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Multiplexing error: {0}")]
    Mux(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The server answered the control request with an error
    #[error("{0}")]
    Rejected(#[from] ControlError),

    #[error("invalid server response")]
    InvalidResponse,

    /// A reconnect succeeded but the server assigned a different identity
    #[error("resume mismatch: {0}")]
    ResumeMismatch(String),

    #[error("Invalid control URL: {0}")]
    InvalidUrl(String),

    #[error("Cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Whether the error is one of the rejections a client retries after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Rejected(err) if err.is_retryable())
    }
}
