//! Client configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (SLUICE_*)
//! 2. Config file (`~/.config/sluice/config.toml` unless given explicitly)
//! 3. Default values

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sluice_common::{load_client_config, ControlEndpoint, TunnelError};

/// Environment variable prefix
const ENV_PREFIX: &str = "SLUICE";

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Client configuration (connection settings only)
///
/// What to expose and how is given on the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Control URL of the server (e.g. "https://tunnel.example.com")
    #[serde(alias = "server_addr")]
    pub server_url: Option<String>,

    pub authtoken: Option<String>,

    /// CA bundle trusted instead of the web PKI roots
    #[serde(alias = "ca_cert_path")]
    pub tls_ca: Option<PathBuf>,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ResolvedClientConfig {
    pub server_url: String,
    pub authtoken: String,
    pub tls_ca: Option<PathBuf>,
}

fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

impl ClientConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sluice")
            .join("config.toml")
    }

    /// Load configuration from a TOML file; a missing file is an empty config
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> ResolvedClientConfig {
        let server_url = get_env("SERVER_URL")
            .or(self.server_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        let authtoken = get_env("AUTHTOKEN")
            .or(self.authtoken)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        let tls_ca = get_env("TLS_CA").map(PathBuf::from).or(self.tls_ca);

        ResolvedClientConfig {
            server_url,
            authtoken,
            tls_ca,
        }
    }

    /// Load a config file (the default one when `path` is `None`) and resolve it
    pub fn load_and_resolve(path: Option<&Path>) -> anyhow::Result<ResolvedClientConfig> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        Ok(Self::load(&path)?.resolve())
    }
}

impl ResolvedClientConfig {
    /// Control endpoint for the configured server
    pub fn endpoint(&self) -> Result<ControlEndpoint, TunnelError> {
        let endpoint = ControlEndpoint::parse(&self.server_url)?;
        match (&self.tls_ca, endpoint.is_tls()) {
            (Some(ca), true) => Ok(endpoint.with_tls_config(load_client_config(Some(ca.as_path()))?)),
            _ => Ok(endpoint),
        }
    }
}

/// Expand a bare port (`3000`) into a loopback address
pub fn normalize_local_addr(addr: &str) -> String {
    let addr = addr.trim();
    if is_port_literal(addr) {
        format!("127.0.0.1:{}", addr)
    } else {
        addr.to_string()
    }
}

fn is_port_literal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && parse_port(s).is_some()
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|port| *port > 0)
}

/// Rejected local service target
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid upstream {input:?}: {reason}")]
pub struct InvalidUpstream {
    pub input: String,
    pub reason: &'static str,
}

/// How the client talks to the local HTTP service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpstreamScheme {
    #[default]
    Http,
    Https,
}

impl UpstreamScheme {
    fn default_port(self) -> u16 {
        match self {
            UpstreamScheme::Http => 80,
            UpstreamScheme::Https => 443,
        }
    }
}

impl fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamScheme::Http => f.write_str("http"),
            UpstreamScheme::Https => f.write_str("https"),
        }
    }
}

/// Local HTTP service a tunnel forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUpstream {
    pub scheme: UpstreamScheme,
    /// Host name or IP literal, without brackets
    pub host: String,
    pub port: u16,
}

impl HttpUpstream {
    /// Dialable `host:port`
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HttpUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.addr())
    }
}

/// Split `host:port` (or `[v6]:port`), the port being optional
fn split_host_port(authority: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after {
            "" => Some((host, None)),
            _ => Some((host, Some(after.strip_prefix(':')?))),
        };
    }

    match authority.split_once(':') {
        Some((_, port)) if port.contains(':') => None,
        Some((host, port)) => Some((host, Some(port))),
        None => Some((authority, None)),
    }
}

/// Parse the local target of an HTTP tunnel
///
/// Accepts a bare port (`3000`, loopback), `host:port`, or an `http://` /
/// `https://` URL with an optional port and no path beyond `/`, query,
/// fragment or userinfo.
pub fn parse_http_upstream(input: &str) -> Result<HttpUpstream, InvalidUpstream> {
    let invalid = |reason| InvalidUpstream {
        input: input.to_string(),
        reason,
    };

    let raw = input.trim();
    if raw.is_empty() {
        return Err(invalid("empty upstream"));
    }

    if is_port_literal(raw) {
        return Ok(HttpUpstream {
            scheme: UpstreamScheme::Http,
            host: "127.0.0.1".to_string(),
            port: parse_port(raw).ok_or_else(|| invalid("invalid port"))?,
        });
    }

    let Some((scheme, rest)) = raw.split_once("://") else {
        let (host, port) = split_host_port(raw).ok_or_else(|| invalid("malformed address"))?;
        let port = port.ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        return Ok(HttpUpstream {
            scheme: UpstreamScheme::Http,
            host: host.to_string(),
            port: parse_port(port).ok_or_else(|| invalid("invalid port"))?,
        });
    };

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" => UpstreamScheme::Http,
        "https" => UpstreamScheme::Https,
        _ => return Err(invalid("unsupported scheme")),
    };

    let (rest, fragment) = rest.split_once('#').unwrap_or((rest, ""));
    if !fragment.is_empty() {
        return Err(invalid("fragment not supported"));
    }
    let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
    if !query.is_empty() {
        return Err(invalid("query not supported"));
    }
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    if !path.is_empty() && path != "/" {
        return Err(invalid("path not supported"));
    }
    if authority.contains('@') {
        return Err(invalid("userinfo not supported"));
    }

    let (host, port) = split_host_port(authority).ok_or_else(|| invalid("malformed address"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = match port {
        Some(port) => parse_port(port).ok_or_else(|| invalid("invalid port"))?,
        None => scheme.default_port(),
    };

    Ok(HttpUpstream {
        scheme,
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            server_url = "https://tunnel.example.com"
            authtoken = "secret"
            ca_cert_path = "/etc/sluice/ca.pem"
            "#,
        )
        .unwrap();

        assert_eq!(config.server_url.as_deref(), Some("https://tunnel.example.com"));
        assert_eq!(config.authtoken.as_deref(), Some("secret"));
        assert_eq!(config.tls_ca, Some(PathBuf::from("/etc/sluice/ca.pem")));
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let config = ClientConfig::load(Path::new("/nonexistent/sluice/config.toml")).unwrap();
        assert!(config.server_url.is_none());
        assert!(config.authtoken.is_none());
    }

    #[test]
    fn test_default_path() {
        let path = ClientConfig::default_path();
        assert!(path.ends_with("sluice/config.toml"));
    }

    #[test]
    fn test_endpoint_from_resolved() {
        let resolved = ResolvedClientConfig {
            server_url: "http://127.0.0.1:9000".to_string(),
            authtoken: String::new(),
            tls_ca: None,
        };
        let endpoint = resolved.endpoint().unwrap();
        assert_eq!(endpoint.port, 9000);
        assert!(!endpoint.is_tls());
    }

    #[test]
    fn test_normalize_local_addr() {
        assert_eq!(normalize_local_addr("3000"), "127.0.0.1:3000");
        assert_eq!(normalize_local_addr(" localhost:8080 "), "localhost:8080");
        assert_eq!(normalize_local_addr("[::1]:80"), "[::1]:80");
        assert_eq!(normalize_local_addr("70000"), "70000");
    }

    #[test]
    fn test_http_upstream_plain_targets() {
        let upstream = parse_http_upstream("3000").unwrap();
        assert_eq!(upstream.scheme, UpstreamScheme::Http);
        assert_eq!(upstream.addr(), "127.0.0.1:3000");

        let upstream = parse_http_upstream(" localhost:3000 ").unwrap();
        assert_eq!(upstream.addr(), "localhost:3000");
        assert_eq!(upstream.to_string(), "http://localhost:3000");

        let upstream = parse_http_upstream("[::1]:8080").unwrap();
        assert_eq!(upstream.host, "::1");
        assert_eq!(upstream.addr(), "[::1]:8080");

        assert!(parse_http_upstream("").is_err());
        assert!(parse_http_upstream("localhost").is_err());
        assert!(parse_http_upstream("localhost:0").is_err());
    }

    #[test]
    fn test_http_upstream_urls() {
        let upstream = parse_http_upstream("https://localhost").unwrap();
        assert_eq!(upstream.scheme, UpstreamScheme::Https);
        assert_eq!(upstream.addr(), "localhost:443");

        let upstream = parse_http_upstream("HTTP://127.0.0.1:8080/").unwrap();
        assert_eq!(upstream.scheme, UpstreamScheme::Http);
        assert_eq!(upstream.addr(), "127.0.0.1:8080");

        let upstream = parse_http_upstream("https://[::1]:8443").unwrap();
        assert_eq!(upstream.addr(), "[::1]:8443");
    }

    #[test]
    fn test_http_upstream_url_rejections() {
        let reason = |input: &str| parse_http_upstream(input).unwrap_err().reason;

        assert_eq!(reason("https://localhost:8443/foo"), "path not supported");
        assert_eq!(reason("https://localhost:8443?x=1"), "query not supported");
        assert_eq!(reason("https://localhost:8443/#top"), "fragment not supported");
        assert_eq!(reason("https://user:pw@localhost:8443"), "userinfo not supported");
        assert_eq!(reason("ftp://localhost:21"), "unsupported scheme");
        assert_eq!(reason("https://:8443"), "missing host");
        assert_eq!(reason("https://localhost:99999"), "invalid port");
    }
}
