//! Control connection establishment.
//!
//! A client reaches the control endpoint with an HTTP/1.1 `GET /control`
//! request asking to upgrade to the `sluice-mux/1` protocol. After the server
//! answers `101 Switching Protocols` the raw connection carries a
//! multiplexed session.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use sluice_protocol::{CONTROL_PATH, UPGRADE_PROTOCOL};

use crate::mux::{MuxSession, Role};
use crate::tls::load_client_config_from_pem;
use crate::TunnelError;

/// Where and how to reach a server's control endpoint
#[derive(Clone)]
pub struct ControlEndpoint {
    pub host: String,
    pub port: u16,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for ControlEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl ControlEndpoint {
    /// Parse `http://host[:port]`, `https://host[:port]` or a bare `host:port`
    ///
    /// `https` endpoints trust the bundled web PKI roots unless
    /// [`ControlEndpoint::with_tls_config`] installs another configuration.
    pub fn parse(url: &str) -> Result<Self, TunnelError> {
        let url = url.trim();
        let uri: Uri = url
            .parse()
            .map_err(|e| TunnelError::InvalidUrl(format!("{}: {}", url, e)))?;

        let secure = match uri.scheme_str() {
            None | Some("http") | Some("ws") => false,
            Some("https") | Some("wss") => true,
            Some(other) => {
                return Err(TunnelError::InvalidUrl(format!(
                    "unsupported scheme {:?}",
                    other
                )))
            }
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TunnelError::InvalidUrl(format!("{}: missing host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let tls = if secure {
            let config = load_client_config_from_pem(None)?;
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };

        Ok(Self { host, port, tls })
    }

    /// Replace the TLS configuration used for `https` endpoints
    pub fn with_tls_config(mut self, config: rustls::ClientConfig) -> Self {
        self.tls = Some(TlsConnector::from(Arc::new(config)));
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Value for the `Host` header of the upgrade request
    fn authority(&self) -> String {
        let default_port = if self.is_tls() { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Dial the control endpoint and establish a client-side multiplexed session
pub async fn dial_control(endpoint: &ControlEndpoint) -> Result<MuxSession, TunnelError> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    stream.set_nodelay(true)?;

    let authority = endpoint.authority();
    let session = match &endpoint.tls {
        Some(connector) => {
            let server_name = ServerName::try_from(endpoint.host.clone())
                .map_err(|e| TunnelError::Tls(format!("Invalid server name: {}", e)))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| TunnelError::Tls(format!("TLS handshake failed: {}", e)))?;
            let io = upgrade(tls_stream, &authority).await?;
            MuxSession::new(io, Role::Client)
        }
        None => {
            let io = upgrade(stream, &authority).await?;
            MuxSession::new(io, Role::Client)
        }
    };

    tracing::debug!("Control session established with {}", authority);
    Ok(session)
}

async fn upgrade<S>(
    stream: S,
    authority: &str,
) -> Result<TokioIo<hyper::upgrade::Upgraded>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| TunnelError::Http(format!("control handshake: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!("Control connection error: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(CONTROL_PATH)
        .header(HOST, authority)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL)
        .body(Empty::<Bytes>::new())
        .map_err(|e| TunnelError::Http(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| TunnelError::Http(format!("control upgrade: {}", e)))?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(TunnelError::Protocol(format!(
            "control upgrade refused: {}",
            response.status()
        )));
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| TunnelError::Http(format!("control upgrade: {}", e)))?;

    Ok(TokioIo::new(upgraded))
}

/// Whether a request asks to open a control connection
pub fn is_control_upgrade<B>(req: &Request<B>) -> bool {
    if req.method() != Method::GET || req.uri().path() != CONTROL_PATH {
        return false;
    }

    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case(UPGRADE_PROTOCOL))
        .unwrap_or(false)
}
