//! Edge access policies attached to HTTP tunnels
//!
//! Everything here is parsed once from the control request and then
//! evaluated for every public request routed to the tunnel.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use ipnet::IpNet;
use subtle::ConstantTimeEq;
use thiserror::Error;

use sluice_protocol::{ControlError, ErrorKind, HeaderKv, HttpTunnelRequest};

pub const MAX_CIDR_ENTRIES: usize = 64;
pub const MAX_ALLOWLIST_ENTRIES: usize = 32;
pub const MAX_HEADER_TRANSFORM_ENTRIES: usize = 32;
pub const MAX_HEADER_VALUE_BYTES: usize = 8 * 1024;

/// Headers a tunnel may not add or remove
const PROTECTED_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "host",
];

/// A rejected policy field
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid {field}: too many entries")]
    TooManyEntries { field: &'static str },

    #[error("invalid {field}")]
    EmptyEntry { field: &'static str },

    #[error("invalid {field}: {value:?}")]
    InvalidEntry { field: &'static str, value: String },
}

impl From<PolicyError> for ControlError {
    fn from(err: PolicyError) -> Self {
        ControlError::with_message(ErrorKind::InvalidRequest, err.to_string())
    }
}

fn invalid(field: &'static str, value: &str) -> PolicyError {
    PolicyError::InvalidEntry {
        field,
        value: value.to_string(),
    }
}

/// `user:pass` credential for a tunnel
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuthCredential {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthCredential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BasicAuthCredential {
    /// Parse `user:pass`; an empty string means no credential
    ///
    /// The user is trimmed, the password is kept as given.
    pub fn parse(raw: &str) -> Result<Option<Self>, PolicyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let (user, password) = raw
            .split_once(':')
            .ok_or_else(|| invalid("basic_auth", "missing ':'"))?;
        let user = user.trim();
        if user.is_empty() {
            return Err(invalid("basic_auth", "empty user"));
        }

        Ok(Some(Self {
            user: user.to_string(),
            password: password.to_string(),
        }))
    }

    /// Check an `Authorization` header in constant time
    pub fn verify(&self, header: Option<&HeaderValue>) -> bool {
        let Some((user, password)) = header.and_then(decode_basic_authorization) else {
            return false;
        };

        let user_ok = self.user.as_bytes().ct_eq(user.as_bytes());
        let password_ok = self.password.as_bytes().ct_eq(password.as_bytes());
        (user_ok & password_ok).into()
    }
}

fn decode_basic_authorization(value: &HeaderValue) -> Option<(String, String)> {
    let value = value.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Parse a list of IPs and CIDRs into masked prefixes
///
/// Bare addresses become single-host prefixes; IPv4-mapped IPv6 addresses
/// are treated as IPv4.
pub fn parse_cidr_list(field: &'static str, values: &[String]) -> Result<Vec<IpNet>, PolicyError> {
    if values.len() > MAX_CIDR_ENTRIES {
        return Err(PolicyError::TooManyEntries { field });
    }

    values
        .iter()
        .map(|raw| {
            let value = raw.trim();
            if value.is_empty() {
                return Err(PolicyError::EmptyEntry { field });
            }

            if value.contains('/') {
                let net: IpNet = value.parse().map_err(|_| invalid(field, raw))?;
                return Ok(net.trunc());
            }

            let ip: IpAddr = value.parse().map_err(|_| invalid(field, raw))?;
            Ok(IpNet::from(unmap_ip(ip)))
        })
        .collect()
}

/// Treat `::ffff:a.b.c.d` as `a.b.c.d`
pub fn unmap_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Parse HTTP method tokens, uppercased
pub fn parse_method_list(field: &'static str, values: &[String]) -> Result<Vec<String>, PolicyError> {
    if values.len() > MAX_ALLOWLIST_ENTRIES {
        return Err(PolicyError::TooManyEntries { field });
    }

    values
        .iter()
        .map(|raw| {
            let method = raw.trim();
            if method.is_empty() || !method.bytes().all(is_token_byte) {
                return Err(invalid(field, raw));
            }
            Ok(method.to_ascii_uppercase())
        })
        .collect()
}

/// Parse absolute request paths (no query or fragment)
pub fn parse_path_list(field: &'static str, values: &[String]) -> Result<Vec<String>, PolicyError> {
    if values.len() > MAX_ALLOWLIST_ENTRIES {
        return Err(PolicyError::TooManyEntries { field });
    }

    values
        .iter()
        .map(|raw| {
            let path = raw.trim();
            let valid = path.starts_with('/')
                && !path.contains(['?', '#'])
                && !path.chars().any(|c| c.is_control() || c.is_whitespace());
            if !valid {
                return Err(invalid(field, raw));
            }
            Ok(path.to_string())
        })
        .collect()
}

/// Parse a header name a tunnel is allowed to transform
pub fn parse_header_name(field: &'static str, raw: &str) -> Result<HeaderName, PolicyError> {
    let name = raw.trim();
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(invalid(field, raw));
    }

    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(field, raw))?;
    if PROTECTED_HEADERS.contains(&name.as_str()) {
        return Err(invalid(field, raw));
    }
    Ok(name)
}

/// Validate a header value: trimmed, bounded, and free of control characters
pub fn parse_header_value(field: &'static str, raw: &str) -> Result<HeaderValue, PolicyError> {
    let value = raw.trim();
    let safe = value
        .bytes()
        .all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f));
    if value.len() > MAX_HEADER_VALUE_BYTES || !safe {
        return Err(invalid(field, raw));
    }
    HeaderValue::from_bytes(value.as_bytes()).map_err(|_| invalid(field, raw))
}

pub fn parse_header_name_list(
    field: &'static str,
    values: &[String],
) -> Result<Vec<HeaderName>, PolicyError> {
    if values.len() > MAX_HEADER_TRANSFORM_ENTRIES {
        return Err(PolicyError::TooManyEntries { field });
    }
    values.iter().map(|raw| parse_header_name(field, raw)).collect()
}

pub fn parse_header_kv_list(
    field: &'static str,
    values: &[HeaderKv],
) -> Result<Vec<(HeaderName, HeaderValue)>, PolicyError> {
    if values.len() > MAX_HEADER_TRANSFORM_ENTRIES {
        return Err(PolicyError::TooManyEntries { field });
    }
    values
        .iter()
        .map(|kv| {
            let name = parse_header_name(field, &kv.name)?;
            let value = parse_header_value(field, &kv.value)?;
            Ok((name, value))
        })
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Everything the data plane enforces for one tunnel
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub basic_auth: Option<BasicAuthCredential>,
    pub allow_cidrs: Vec<IpNet>,
    pub deny_cidrs: Vec<IpNet>,
    pub allow_methods: Vec<String>,
    pub allow_paths: Vec<String>,
    pub allow_path_prefixes: Vec<String>,
    pub request_header_add: Vec<(HeaderName, HeaderValue)>,
    pub request_header_remove: Vec<HeaderName>,
    pub response_header_add: Vec<(HeaderName, HeaderValue)>,
    pub response_header_remove: Vec<HeaderName>,
}

impl AccessPolicy {
    /// Parse and validate the policy fields of an HTTP tunnel request
    pub fn from_request(req: &HttpTunnelRequest) -> Result<Self, PolicyError> {
        Ok(Self {
            basic_auth: BasicAuthCredential::parse(&req.basic_auth)?,
            allow_cidrs: parse_cidr_list("allow_cidr", &req.allow_cidr)?,
            deny_cidrs: parse_cidr_list("deny_cidr", &req.deny_cidr)?,
            allow_methods: parse_method_list("allow_method", &req.allow_method)?,
            allow_paths: parse_path_list("allow_path", &req.allow_path)?,
            allow_path_prefixes: parse_path_list("allow_path_prefix", &req.allow_path_prefix)?,
            request_header_add: parse_header_kv_list(
                "request_header_add",
                &req.request_header_add,
            )?,
            request_header_remove: parse_header_name_list(
                "request_header_remove",
                &req.request_header_remove,
            )?,
            response_header_add: parse_header_kv_list(
                "response_header_add",
                &req.response_header_add,
            )?,
            response_header_remove: parse_header_name_list(
                "response_header_remove",
                &req.response_header_remove,
            )?,
        })
    }

    pub fn has_ip_rules(&self) -> bool {
        !self.allow_cidrs.is_empty() || !self.deny_cidrs.is_empty()
    }

    /// Deny entries win over allow entries; an empty allow list admits all
    pub fn ip_allowed(&self, ip: IpAddr) -> bool {
        let ip = unmap_ip(ip);
        if self.deny_cidrs.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        self.allow_cidrs.is_empty() || self.allow_cidrs.iter().any(|net| net.contains(&ip))
    }

    pub fn method_allowed(&self, method: &str) -> bool {
        self.allow_methods.is_empty()
            || self
                .allow_methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.trim()))
    }

    pub fn path_allowed(&self, path: &str) -> bool {
        if self.allow_paths.is_empty() && self.allow_path_prefixes.is_empty() {
            return true;
        }
        self.allow_paths.iter().any(|p| p == path)
            || self.allow_path_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    pub fn apply_request_headers(&self, headers: &mut HeaderMap) {
        apply_header_transforms(headers, &self.request_header_remove, &self.request_header_add);
    }

    pub fn apply_response_headers(&self, headers: &mut HeaderMap) {
        apply_header_transforms(headers, &self.response_header_remove, &self.response_header_add);
    }
}

/// Removals first, then additions (which replace any existing value)
fn apply_header_transforms(
    headers: &mut HeaderMap,
    remove: &[HeaderName],
    add: &[(HeaderName, HeaderValue)],
) {
    for name in remove {
        headers.remove(name);
    }
    for (name, value) in add {
        headers.insert(name.clone(), value.clone());
    }
}
