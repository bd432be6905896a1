use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_TYPE, HOST, UPGRADE,
    WWW_AUTHENTICATE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use sluice_common::{is_control_upgrade, proxy_bidirectional, MuxSession, ProxyStats, Role};
use sluice_protocol::UPGRADE_PROTOCOL;

use crate::control_plane::ControlPlane;
use crate::registry::{HttpTunnelEntry, TunnelRegistry};
use crate::router::{request_client_ip, tunnel_id_from_host};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const BASIC_AUTH_CHALLENGE: &str = "Basic realm=\"sluice\"";

/// Inbound forwarding headers dropped unless the proxy in front is trusted
const FORWARDING_HEADERS: &[&str] = &[
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-real-ip",
];

/// Connection-scoped headers never forwarded across the tunnel
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub tunnel_domain: String,
    pub trust_proxy_headers: bool,
}

/// Public HTTP listener: control upgrades and tunnel traffic
pub struct HttpPlane {
    control: Arc<ControlPlane>,
    registry: Arc<TunnelRegistry>,
    settings: HttpSettings,
    /// Optional TLS acceptor for HTTPS mode
    tls_acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
}

impl HttpPlane {
    pub fn new(
        control: Arc<ControlPlane>,
        settings: HttpSettings,
        tls_acceptor: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: control.registry().clone(),
            control,
            settings,
            tls_acceptor,
            shutdown,
        })
    }

    /// Start listening for HTTP/HTTPS traffic
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        if self.tls_acceptor.is_some() {
            tracing::info!("HTTPS plane listening on {}", addr);
        } else {
            tracing::info!("HTTP plane listening on {}", addr);
        }

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("HTTP plane on {} stopped", addr);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("HTTP accept error: {}", e);
                        continue;
                    }
                },
            };
            tracing::debug!("HTTP connection from {}", peer_addr);
            let _ = stream.set_nodelay(true);
            let this = self.clone();

            tokio::spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => this.serve_connection(tls_stream, peer_addr).await,
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req, peer_addr).await }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        tracing::debug!(
            "HTTP request: {} {} (Host: {:?})",
            req.method(),
            req.uri(),
            req.headers().get(HOST)
        );

        if is_control_upgrade(&req) {
            return Ok(self.accept_control(req, peer_addr));
        }

        let Some(host) = request_host(&req) else {
            return Ok(text_response(StatusCode::NOT_FOUND, "tunnel not found"));
        };
        let entry = tunnel_id_from_host(&host, &self.settings.tunnel_domain)
            .and_then(|id| self.registry.get(&id));
        let Some(entry) = entry else {
            tracing::debug!("No tunnel for host: {}", host);
            return Ok(text_response(StatusCode::NOT_FOUND, "tunnel not found"));
        };

        Ok(self.proxy(entry, req, host, peer_addr).await)
    }

    /// Switch the connection to a multiplexed control session
    fn accept_control(&self, mut req: Request<Incoming>, peer_addr: SocketAddr) -> Response<ProxyBody> {
        let on_upgrade = hyper::upgrade::on(&mut req);
        let control = self.control.clone();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    tracing::debug!("Control connection upgraded for {}", peer_addr);
                    let session = MuxSession::new(TokioIo::new(upgraded), Role::Server);
                    control.handle_session(session, peer_addr).await;
                }
                Err(e) => tracing::warn!("Control upgrade from {} failed: {}", peer_addr, e),
            }
        });

        let mut resp = Response::new(empty());
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        resp.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        resp.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
        resp
    }

    /// Enforce the tunnel's policy, then forward over a fresh stream
    async fn proxy(
        &self,
        entry: Arc<HttpTunnelEntry>,
        mut req: Request<Incoming>,
        host: String,
        peer_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let policy = &entry.policy;
        let trusted = self.settings.trust_proxy_headers;
        let client_ip = request_client_ip(req.headers(), peer_addr, trusted);

        if policy.has_ip_rules() {
            match client_ip {
                Some(ip) if policy.ip_allowed(ip) => {}
                _ => return text_response(StatusCode::FORBIDDEN, "forbidden"),
            }
        }

        // Disallowed routes look exactly like unknown tunnels
        if !policy.method_allowed(req.method().as_str()) || !policy.path_allowed(req.uri().path()) {
            return text_response(StatusCode::NOT_FOUND, "tunnel not found");
        }

        if let Some(credential) = &policy.basic_auth {
            if !credential.verify(req.headers().get(AUTHORIZATION)) {
                let mut resp = text_response(StatusCode::UNAUTHORIZED, "unauthorized");
                resp.headers_mut()
                    .insert(WWW_AUTHENTICATE, HeaderValue::from_static(BASIC_AUTH_CHALLENGE));
                return resp;
            }
            req.headers_mut().remove(AUTHORIZATION);
        }

        let upgrade = requested_upgrade(req.headers());
        if !trusted {
            set_forwarding_headers(
                req.headers_mut(),
                client_ip.unwrap_or_else(|| peer_addr.ip()),
                &host,
                self.tls_acceptor.is_some(),
            );
        }
        strip_hop_by_hop(req.headers_mut(), upgrade.is_some());
        if let Some(protocol) = &upgrade {
            req.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            req.headers_mut().insert(UPGRADE, protocol.clone());
        }
        policy.apply_request_headers(req.headers_mut());

        if let Some(path_and_query) = req.uri().path_and_query().cloned() {
            *req.uri_mut() = path_and_query.into();
        }

        match self.forward(&entry, req, upgrade.is_some()).await {
            Ok(mut resp) => {
                policy.apply_response_headers(resp.headers_mut());
                resp
            }
            Err(e) => {
                tracing::debug!("Tunnel {} upstream error: {}", entry.id, e);
                text_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }

    /// One request/response cycle on its own stream
    async fn forward(
        &self,
        entry: &HttpTunnelEntry,
        mut req: Request<Incoming>,
        upgrade: bool,
    ) -> Result<Response<ProxyBody>> {
        let stream = entry.session.open_stream().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        let tunnel_id = entry.id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!("Upstream connection for {} failed: {}", tunnel_id, e);
            }
        });

        let public_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));
        let mut resp = sender.send_request(req).await?;

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(public_upgrade) = public_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut resp);
                let cancel = self.shutdown.child_token();
                let tunnel_id = entry.id.clone();
                tokio::spawn(async move {
                    let (public, upstream) = match tokio::try_join!(public_upgrade, upstream_upgrade) {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::debug!("Upgrade through {} failed: {}", tunnel_id, e);
                            return;
                        }
                    };
                    let stats = ProxyStats::new();
                    let _ = proxy_bidirectional(
                        &cancel,
                        TokioIo::new(public),
                        TokioIo::new(upstream),
                        &stats,
                    )
                    .await;
                    tracing::debug!(
                        "Upgraded connection through {} closed ({} bytes in, {} bytes out)",
                        tunnel_id,
                        stats.a_to_b(),
                        stats.b_to_a()
                    );
                });
                return Ok(resp.map(|body| body.boxed()));
            }
        }

        strip_hop_by_hop(resp.headers_mut(), false);
        Ok(resp.map(|body| body.boxed()))
    }
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .map(str::to_string)
}

/// The `Upgrade` protocol, if the request asks for one
fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    headers.get(UPGRADE).cloned()
}

/// Replace client-supplied forwarding headers with our own view
fn set_forwarding_headers(headers: &mut HeaderMap, client_ip: IpAddr, host: &str, tls: bool) {
    for name in FORWARDING_HEADERS {
        headers.remove(*name);
    }

    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
    let proto = if tls { "https" } else { "http" };
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(proto),
    );
}

/// Drop hop-by-hop headers and anything listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let keep = |name: &str| keep_upgrade && (name == "connection" || name == "upgrade");
    for name in &listed {
        if !keep(name.as_str()) {
            headers.remove(name.as_str());
        }
    }
    for name in HOP_BY_HOP_HEADERS {
        if !keep(*name) {
            headers.remove(*name);
        }
    }
}

fn empty() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
