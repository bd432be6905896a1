//! HTTP tunnels: every stream the server opens carries one public request.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use sluice_common::{
    copy_counted, proxy_with, upstream_client_config, ControlEndpoint, MuxSession, MuxStream,
    ProxyStats, TunnelError,
};
use sluice_protocol::HttpTunnelRequest;

use crate::capture::{
    CapturedExchange, ExchangeRecorder, ExchangeTaps, PreviewBuffer, TapReader,
    DEFAULT_PREVIEW_BYTES,
};
use crate::config::UpstreamScheme;
use crate::control::request_http_tunnel;
use crate::host_rewrite::{copy_with_host_rewrite, HostHeader};
use crate::tunnel::{TunnelDriver, TunnelHandle};

/// How to open an HTTP tunnel
#[derive(Clone)]
pub struct HttpTunnelOptions {
    /// Sent to the server as-is (authtoken, subdomain, access policy)
    pub request: HttpTunnelRequest,
    pub host_header: HostHeader,
    /// Reconnect and resume the same host when the connection drops
    pub reconnect: bool,
    /// Bytes of each direction kept for captured exchanges
    pub preview_bytes: usize,
    pub recorder: Option<Arc<dyn ExchangeRecorder>>,
    /// Speak TLS to the local service when `Https`
    pub upstream_scheme: UpstreamScheme,
    /// Accept any certificate from an HTTPS local service
    pub upstream_tls_skip_verify: bool,
}

impl Default for HttpTunnelOptions {
    fn default() -> Self {
        Self {
            request: HttpTunnelRequest::default(),
            host_header: HostHeader::default(),
            reconnect: false,
            preview_bytes: DEFAULT_PREVIEW_BYTES,
            recorder: None,
            upstream_scheme: UpstreamScheme::Http,
            upstream_tls_skip_verify: false,
        }
    }
}

/// What the server assigned to an HTTP tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpIdentity {
    pub id: String,
    pub url: String,
}

impl fmt::Display for HttpIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Host part of a tunnel URL (`https://abc.tunnel.example.com/` -> `abc.tunnel.example.com`)
fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

/// Host part of a dialable `host:port`, without IPv6 brackets
fn addr_host(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// TLS toward an HTTPS local service
#[derive(Clone)]
struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl UpstreamTls {
    fn new(local_addr: &str, skip_verify: bool) -> Result<Self, TunnelError> {
        let config = upstream_client_config(skip_verify)?;
        let server_name = ServerName::try_from(addr_host(local_addr).to_string())
            .map_err(|e| TunnelError::Tls(format!("Invalid upstream name: {}", e)))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

struct HttpDriver {
    local_addr: String,
    upstream_tls: Option<UpstreamTls>,
    request: HttpTunnelRequest,
    host: Option<String>,
    preview_bytes: usize,
    recorder: Option<Arc<dyn ExchangeRecorder>>,
}

impl HttpDriver {
    /// The request to send, pinned to `previous` when resuming
    fn request_for(&self, previous: Option<&HttpIdentity>) -> HttpTunnelRequest {
        let mut request = self.request.clone();
        if let Some(previous) = previous {
            if request.subdomain.trim().is_empty() && request.domain.trim().is_empty() {
                request.domain = url_host(&previous.url).to_string();
            }
        }
        request
    }
}

#[async_trait]
impl TunnelDriver for HttpDriver {
    type Identity = HttpIdentity;

    async fn establish(
        &self,
        session: &MuxSession,
        previous: Option<&HttpIdentity>,
    ) -> Result<HttpIdentity, TunnelError> {
        let response = request_http_tunnel(session, self.request_for(previous)).await?;
        Ok(HttpIdentity {
            id: response.id,
            url: response.url,
        })
    }

    async fn handle_stream(&self, stream: MuxStream, cancel: CancellationToken) {
        let local = match TcpStream::connect(&self.local_addr).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!("Failed to connect to local service {}: {}", self.local_addr, e);
                return;
            }
        };
        let _ = local.set_nodelay(true);

        let Some(tls) = &self.upstream_tls else {
            return self.bridge(stream, local, cancel).await;
        };
        match tls.connector.connect(tls.server_name.clone(), local).await {
            Ok(local) => self.bridge(stream, local, cancel).await,
            Err(e) => {
                tracing::warn!("TLS handshake with local service {} failed: {}", self.local_addr, e);
            }
        }
    }
}

impl HttpDriver {
    /// Relay one exchange between a tunnel stream and the local service
    async fn bridge<L>(&self, stream: MuxStream, local: L, cancel: CancellationToken)
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        let started_at = Utc::now();
        let clock = Instant::now();
        let stats = ProxyStats::new();

        let (request_tap, response_tap) = match self.recorder {
            Some(_) => (
                Some(PreviewBuffer::new(self.preview_bytes)),
                Some(PreviewBuffer::new(self.preview_bytes)),
            ),
            None => (None, None),
        };

        let host = self.host.clone();
        let forward_counter = stats.a_to_b_counter();
        let backward_counter = stats.b_to_a_counter();
        let forward_tap = request_tap.clone();
        let backward_tap = response_tap.clone();

        let result = proxy_with(
            &cancel,
            stream,
            local,
            move |reader, writer| async move {
                let reader = TapReader::new(reader, forward_tap);
                match host {
                    Some(host) => copy_with_host_rewrite(reader, writer, &host, &forward_counter).await,
                    None => copy_counted(reader, writer, &forward_counter).await,
                }
            },
            move |reader, writer| async move {
                copy_counted(TapReader::new(reader, backward_tap), writer, &backward_counter).await
            },
        )
        .await;

        match result {
            Ok(()) | Err(TunnelError::Cancelled) => {}
            Err(e) => tracing::debug!("Stream to {} ended with error: {}", self.local_addr, e),
        }
        tracing::debug!(
            "Stream to {} closed ({} bytes in, {} bytes out)",
            self.local_addr,
            stats.a_to_b(),
            stats.b_to_a()
        );

        if let (Some(recorder), Some(request), Some(response)) =
            (&self.recorder, request_tap, response_tap)
        {
            let taps = ExchangeTaps {
                started_at,
                duration: clock.elapsed(),
                request: request.snapshot(),
                response: response.snapshot(),
                bytes_in: stats.a_to_b(),
                bytes_out: stats.b_to_a(),
            };
            if let Some(exchange) = CapturedExchange::from_taps(taps) {
                recorder.record(exchange);
            }
        }
    }
}

/// A running HTTP tunnel
pub struct HttpTunnel {
    local_addr: String,
    handle: TunnelHandle<HttpDriver>,
}

impl HttpTunnel {
    /// Ask the server for an HTTP tunnel forwarding to `local_addr`
    pub async fn start(
        endpoint: ControlEndpoint,
        local_addr: impl Into<String>,
        options: HttpTunnelOptions,
        cancel: &CancellationToken,
    ) -> Result<Self, TunnelError> {
        let local_addr = local_addr.into();
        let upstream_tls = match options.upstream_scheme {
            UpstreamScheme::Https => Some(UpstreamTls::new(&local_addr, options.upstream_tls_skip_verify)?),
            UpstreamScheme::Http => None,
        };
        let driver = HttpDriver {
            local_addr: local_addr.clone(),
            upstream_tls,
            request: options.request,
            host: options.host_header.target(&local_addr),
            preview_bytes: options.preview_bytes,
            recorder: options.recorder,
        };

        let handle = TunnelHandle::start(endpoint, driver, options.reconnect, cancel).await?;
        let identity = handle.core().identity();
        tracing::info!("HTTP tunnel {} established: {} -> {}", identity.id, identity.url, local_addr);

        Ok(Self { local_addr, handle })
    }

    pub fn id(&self) -> String {
        self.handle.core().identity().id
    }

    pub fn url(&self) -> String {
        self.handle.core().identity().url
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stop accepting streams and close the connection; idempotent
    pub fn close(&self) {
        self.handle.close();
    }

    /// Wait for the tunnel to end; closing and cancellation are not errors
    pub async fn wait(&mut self) -> Result<(), TunnelError> {
        self.handle.wait().await
    }
}
