use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ErrorKind};

/// Type of tunnel to establish
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    /// HTTP tunnel routed by `Host` header
    Http,
    /// Raw TCP tunnel on a public port
    Tcp,
}

impl TunnelType {
    /// Parse a wire `type` value, ignoring case and surrounding whitespace
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Some(TunnelType::Http),
            "tcp" => Some(TunnelType::Tcp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelType::Http => "http",
            TunnelType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A header to add on the request or response path
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeaderKv {
    pub name: String,
    pub value: String,
}

impl HeaderKv {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request for an HTTP tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpTunnelRequest {
    pub authtoken: String,

    /// Desired subdomain label (empty = allocate a random id)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subdomain: String,

    /// Desired full domain under the tunnel domain
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,

    /// `user:pass` credential required from public clients
    #[serde(skip_serializing_if = "String::is_empty")]
    pub basic_auth: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_cidr: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deny_cidr: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_header_add: Vec<HeaderKv>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_header_remove: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_header_add: Vec<HeaderKv>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_header_remove: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_method: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_path: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow_path_prefix: Vec<String>,
}

/// Request for a TCP tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TcpTunnelRequest {
    pub authtoken: String,

    /// Requested public port (0 = auto-allocate)
    pub remote_port: u16,
}

/// A fully decoded control request
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Http(HttpTunnelRequest),
    Tcp(TcpTunnelRequest),
}

impl ControlRequest {
    pub fn tunnel_type(&self) -> TunnelType {
        match self {
            ControlRequest::Http(_) => TunnelType::Http,
            ControlRequest::Tcp(_) => TunnelType::Tcp,
        }
    }

    pub fn authtoken(&self) -> &str {
        match self {
            ControlRequest::Http(req) => &req.authtoken,
            ControlRequest::Tcp(req) => &req.authtoken,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    tunnel_type: String,
    #[serde(default)]
    authtoken: String,
}

/// First decoding phase of a control request
///
/// Only the envelope (`type` and `authtoken`) is interpreted; the rest of the
/// payload is kept until [`RawControlRequest::into_request`] decodes it for
/// the named type.
#[derive(Debug, Clone)]
pub struct RawControlRequest {
    tunnel_type: String,
    authtoken: String,
    payload: serde_json::Value,
}

impl<'de> Deserialize<'de> for RawControlRequest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let payload = serde_json::Value::deserialize(deserializer)?;
        if !payload.is_object() {
            return Err(de::Error::custom("control request must be a JSON object"));
        }
        let envelope = Envelope::deserialize(&payload).map_err(de::Error::custom)?;

        Ok(Self {
            tunnel_type: envelope.tunnel_type,
            authtoken: envelope.authtoken,
            payload,
        })
    }
}

impl RawControlRequest {
    /// The `type` field exactly as sent
    pub fn raw_type(&self) -> &str {
        &self.tunnel_type
    }

    /// The recognized tunnel type, if any
    pub fn tunnel_type(&self) -> Option<TunnelType> {
        TunnelType::parse(&self.tunnel_type)
    }

    pub fn authtoken(&self) -> &str {
        &self.authtoken
    }

    /// Second decoding phase: decode the type-specific payload
    pub fn into_request(self) -> Result<ControlRequest, ControlError> {
        let invalid = |_| ControlError::new(ErrorKind::InvalidRequest);

        match self.tunnel_type() {
            Some(TunnelType::Http) => HttpTunnelRequest::deserialize(self.payload)
                .map(ControlRequest::Http)
                .map_err(invalid),
            Some(TunnelType::Tcp) => TcpTunnelRequest::deserialize(self.payload)
                .map(ControlRequest::Tcp)
                .map_err(invalid),
            None => Err(ControlError::new(ErrorKind::UnsupportedType)),
        }
    }
}

fn http_type() -> TunnelType {
    TunnelType::Http
}

fn tcp_type() -> TunnelType {
    TunnelType::Tcp
}

/// Server answer to an HTTP tunnel request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpTunnelResponse {
    #[serde(rename = "type", default = "http_type")]
    pub tunnel_type: TunnelType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl HttpTunnelResponse {
    pub fn success(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tunnel_type: TunnelType::Http,
            id: id.into(),
            url: url.into(),
            error: None,
            error_kind: None,
        }
    }

    pub fn rejected(err: &ControlError) -> Self {
        Self {
            tunnel_type: TunnelType::Http,
            id: String::new(),
            url: String::new(),
            error: Some(err.message.clone()),
            error_kind: Some(err.kind),
        }
    }

    /// Split into success or the rejection it carries
    pub fn into_result(self) -> Result<Self, ControlError> {
        match self.error.as_deref() {
            Some(message) if !message.is_empty() => Err(ControlError::from_parts(
                message.to_string(),
                self.error_kind,
            )),
            _ => Ok(self),
        }
    }
}

/// Server answer to a TCP tunnel request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpTunnelResponse {
    #[serde(rename = "type", default = "tcp_type")]
    pub tunnel_type: TunnelType,

    #[serde(default)]
    pub remote_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TcpTunnelResponse {
    pub fn success(remote_port: u16) -> Self {
        Self {
            tunnel_type: TunnelType::Tcp,
            remote_port,
            error: None,
            error_kind: None,
        }
    }

    pub fn rejected(err: &ControlError) -> Self {
        Self {
            tunnel_type: TunnelType::Tcp,
            remote_port: 0,
            error: Some(err.message.clone()),
            error_kind: Some(err.kind),
        }
    }

    /// Split into success or the rejection it carries
    pub fn into_result(self) -> Result<Self, ControlError> {
        match self.error.as_deref() {
            Some(message) if !message.is_empty() => Err(ControlError::from_parts(
                message.to_string(),
                self.error_kind,
            )),
            _ => Ok(self),
        }
    }
}
