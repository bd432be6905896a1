use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable category of a rejected control request
///
/// Travels next to the human-readable `error` string so clients can decide
/// whether to retry without matching on message text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or oversized control payload
    Protocol,
    /// Request fields failed validation
    InvalidRequest,
    /// Token rejected or identity not allowed to claim a resource
    Unauthorized,
    /// The token validator or resolver itself failed
    AuthError,
    /// Per-token concurrency cap reached
    TooManyTunnels,
    /// Per-token creation rate exceeded
    RateLimited,
    /// Unknown tunnel `type`
    UnsupportedType,
    /// The requested TCP port could not be bound
    PortUnavailable,
    /// Every port of the configured range is busy
    NoPortsAvailable,
    /// Id generation or reservation could not complete
    AllocationFailed,
    /// Registry rejected the tunnel (duplicate id)
    RegistrationFailed,
    /// Kind sent by a newer peer that this build does not know
    #[serde(other)]
    Unknown,
}

impl ErrorKind {
    /// Whether a client should retry the same request after a backoff
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TooManyTunnels | ErrorKind::RateLimited | ErrorKind::PortUnavailable
        )
    }

    /// Default message sent in the `error` field for this kind
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "invalid request",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::AuthError => "auth error",
            ErrorKind::TooManyTunnels => "too many active tunnels",
            ErrorKind::RateLimited => "rate limit exceeded",
            ErrorKind::UnsupportedType => "unsupported tunnel type",
            ErrorKind::PortUnavailable => "requested port unavailable",
            ErrorKind::NoPortsAvailable => "no ports available",
            ErrorKind::AllocationFailed => "failed to allocate id",
            ErrorKind::RegistrationFailed => "failed to register tunnel",
            ErrorKind::Unknown => "unknown error",
        }
    }

    /// Best-effort classification of a bare `error` string from a peer that
    /// does not send `error_kind`
    pub fn from_message(message: &str) -> Self {
        match message.trim() {
            "too many active tunnels" => ErrorKind::TooManyTunnels,
            "rate limit exceeded" => ErrorKind::RateLimited,
            "requested port unavailable" => ErrorKind::PortUnavailable,
            "no ports available" => ErrorKind::NoPortsAvailable,
            "unauthorized" => ErrorKind::Unauthorized,
            "auth error" => ErrorKind::AuthError,
            "unsupported tunnel type" => ErrorKind::UnsupportedType,
            "failed to register tunnel" => ErrorKind::RegistrationFailed,
            "invalid request" => ErrorKind::InvalidRequest,
            _ => ErrorKind::Unknown,
        }
    }
}

/// A rejection carried in a control response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ControlError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ControlError {
    /// Rejection with the default message for `kind`
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.message().to_string(),
        }
    }

    /// Rejection with a specific message
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Rebuild a rejection from response fields
    pub(crate) fn from_parts(message: String, kind: Option<ErrorKind>) -> Self {
        let kind = kind.unwrap_or_else(|| ErrorKind::from_message(&message));
        Self { kind, message }
    }
}
