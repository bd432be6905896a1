//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (SLUICE_*)
//! 2. Config file (server.toml)
//! 3. Default values (where applicable)

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::store::{MemoryStore, TokenId};

/// Environment variable prefix
const ENV_PREFIX: &str = "SLUICE";

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_TCP_PORT_RANGE: (u16, u16) = (30000, 40000);

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Public listener for control upgrades and tunnel traffic
    pub http_addr: Option<String>,

    /// Domain tunnels live under (e.g., "tunnel.example.com")
    pub tunnel_domain: Option<String>,

    /// TCP port range for TCP tunnels
    pub tcp_port_range: Option<(u16, u16)>,

    /// Address TCP tunnel listeners bind on
    pub tcp_bind_addr: Option<String>,

    /// Honour X-Forwarded-For / X-Real-IP from a proxy in front of us
    pub trust_proxy_headers: Option<bool>,

    /// Concurrent tunnels per token (0 = unlimited)
    pub max_tunnels_per_token: Option<i64>,

    /// Tunnel creations per token per minute (0 = unlimited)
    pub max_tunnel_creates_per_minute: Option<i64>,

    /// Shared token used when no `[[tokens]]` are configured
    pub auth_token: Option<String>,

    /// TLS certificate for the public listener
    #[serde(alias = "cert_path")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key for the public listener
    #[serde(alias = "key_path")]
    pub tls_key: Option<PathBuf>,

    /// Known tokens and their reservations
    pub tokens: Vec<TokenConfig>,
}

/// One authtoken accepted by the server
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TokenConfig {
    pub token: String,
    pub id: TokenId,
    /// Subdomains reserved for this token at startup
    pub subdomains: Vec<String>,
    /// TCP ports reserved for this token at startup
    pub tcp_ports: Vec<u16>,
}

/// Resolved server configuration
#[derive(Debug)]
pub struct ResolvedServerConfig {
    pub http_addr: SocketAddr,
    pub tunnel_domain: String,
    pub tcp_port_range: (u16, u16),
    pub tcp_bind_addr: IpAddr,
    pub trust_proxy_headers: bool,
    pub max_tunnels_per_token: i64,
    pub max_tunnel_creates_per_minute: i64,
    pub auth_token: Option<String>,
    pub tls: Option<TlsFiles>,
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Get environment variable as u16
fn get_env_u16(name: &str) -> Option<u16> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

fn get_env_i64(name: &str) -> Option<i64> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        // Listener: ENV > config > default 0.0.0.0:8080
        let http_addr = get_env("HTTP_ADDR")
            .or(self.http_addr)
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let http_addr: SocketAddr = http_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", http_addr, e))?;

        // Tunnel domain: ENV > config > required
        let tunnel_domain = get_env("TUNNEL_DOMAIN")
            .or(self.tunnel_domain)
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Tunnel domain required. Set SLUICE_TUNNEL_DOMAIN or tunnel_domain in config"
                )
            })?;

        // TCP port range: ENV > config > default 30000-40000
        let tcp_port_start = get_env_u16("TCP_PORT_START")
            .or(self.tcp_port_range.map(|r| r.0))
            .unwrap_or(DEFAULT_TCP_PORT_RANGE.0);
        let tcp_port_end = get_env_u16("TCP_PORT_END")
            .or(self.tcp_port_range.map(|r| r.1))
            .unwrap_or(DEFAULT_TCP_PORT_RANGE.1);
        if tcp_port_start == 0 || tcp_port_end < tcp_port_start {
            anyhow::bail!("Invalid TCP port range {}-{}", tcp_port_start, tcp_port_end);
        }

        let tcp_bind_addr = match get_env("TCP_BIND_ADDR").or(self.tcp_bind_addr) {
            Some(addr) => addr
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid TCP bind address {}: {}", addr, e))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let trust_proxy_headers = get_env_bool("TRUST_PROXY_HEADERS")
            .or(self.trust_proxy_headers)
            .unwrap_or(false);

        let max_tunnels_per_token = get_env_i64("MAX_TUNNELS_PER_TOKEN")
            .or(self.max_tunnels_per_token)
            .unwrap_or(0);
        let max_tunnel_creates_per_minute = get_env_i64("MAX_TUNNEL_CREATES_PER_MINUTE")
            .or(self.max_tunnel_creates_per_minute)
            .unwrap_or(0);

        let auth_token = get_env("AUTH_TOKEN")
            .or(self.auth_token)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let tls = match (
            get_env("TLS_CERT").map(PathBuf::from).or(self.tls_cert),
            get_env("TLS_KEY").map(PathBuf::from).or(self.tls_key),
        ) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            (None, None) => None,
            _ => anyhow::bail!("Both tls_cert and tls_key must be set to enable TLS"),
        };

        for token in &self.tokens {
            if token.token.trim().is_empty() || token.id <= 0 {
                anyhow::bail!("Every [[tokens]] entry needs a token and a positive id");
            }
        }

        Ok(ResolvedServerConfig {
            http_addr,
            tunnel_domain,
            tcp_port_range: (tcp_port_start, tcp_port_end),
            tcp_bind_addr,
            trust_proxy_headers,
            max_tunnels_per_token,
            max_tunnel_creates_per_minute,
            auth_token,
            tls,
            tokens: self.tokens,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}

impl ResolvedServerConfig {
    /// In-memory token store seeded from `[[tokens]]`, if any are configured
    pub fn build_store(&self) -> Option<MemoryStore> {
        if self.tokens.is_empty() {
            return None;
        }

        let store = MemoryStore::new();
        for token in &self.tokens {
            store.add_token(token.token.trim(), token.id);
            for name in &token.subdomains {
                store.seed_subdomain(token.id, name);
            }
            for port in &token.tcp_ports {
                store.seed_tcp_port(token.id, *port);
            }
        }
        Some(store)
    }
}
