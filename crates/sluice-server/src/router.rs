//! Maps public requests onto tunnels
//!
//! Host parsing and client address resolution shared by the data plane and
//! the control handler.

use std::net::{IpAddr, SocketAddr};

use hyper::header::HeaderMap;

use crate::policy::unmap_ip;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Lowercase, drop one trailing dot and any `:port`
pub fn normalize_domain(value: &str) -> String {
    let value = value.trim();
    let value = strip_port(value);
    let value = value.strip_suffix('.').unwrap_or(value);
    value.to_ascii_lowercase()
}

fn strip_port(value: &str) -> &str {
    // Bracketed IPv6 literal, with or without a port
    if let Some(rest) = value.strip_prefix('[') {
        return rest.split_once(']').map(|(host, _)| host).unwrap_or(rest);
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => value,
    }
}

/// Extract the tunnel id from `<id>.<tunnel_domain>`
///
/// Nested labels and an empty id are rejected.
pub fn tunnel_id_from_host(host: &str, tunnel_domain: &str) -> Option<String> {
    let host = normalize_domain(host);
    let domain = normalize_domain(tunnel_domain);
    if domain.is_empty() {
        return None;
    }

    let id = host.strip_suffix(&domain)?.strip_suffix('.')?;
    if id.is_empty() || id.contains('.') {
        return None;
    }
    Some(id.to_string())
}

/// Host of a domain given either bare or as a URL
pub fn host_from_domain_input(value: &str) -> String {
    let value = value.trim();
    let value = value
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(value);
    let value = value.split(['/', '?', '#']).next().unwrap_or_default();
    let value = value.rsplit_once('@').map(|(_, host)| host).unwrap_or(value);
    normalize_domain(value)
}

/// Whether `label` is a single lowercase DNS label
pub fn is_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Resolve the public client's address
///
/// Forwarding headers are only consulted when the operator trusts the proxy
/// in front of this server. `None` means the chosen source is unparseable.
pub fn request_client_ip(
    headers: &HeaderMap,
    remote_addr: SocketAddr,
    trust_proxy_headers: bool,
) -> Option<IpAddr> {
    if trust_proxy_headers {
        let forwarded_for = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(value) = forwarded_for {
            return parse_ip(value);
        }

        let real_ip = headers
            .get(X_REAL_IP)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(value) = real_ip {
            return parse_ip(value);
        }
    }

    Some(unmap_ip(remote_addr.ip()))
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim_start_matches('[').trim_end_matches(']');
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
        .map(unmap_ip)
}
