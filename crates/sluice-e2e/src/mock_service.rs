//! Mock HTTP service for E2E tests
//!
//! The "local service" a tunnel client forwards to. Every request is
//! recorded for assertions and answered with a configurable response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use rcgen::{CertificateParams, KeyPair};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use sluice_common::load_server_config_from_pem;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Request target as received (path and query)
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, in arrival order
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

struct CannedResponse {
    status: StatusCode,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

#[derive(Clone)]
struct State {
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response: Arc<RwLock<CannedResponse>>,
}

/// A mock HTTP service for testing
pub struct MockHttpService {
    addr: SocketAddr,
    state: State,
}

impl MockHttpService {
    /// Start a mock HTTP service on an ephemeral port
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Start a mock HTTPS service with a fresh self-signed certificate
    /// for `localhost` and `127.0.0.1`
    pub async fn start_tls() -> Self {
        let key = KeyPair::generate().expect("Failed to generate key");
        let cert = CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .expect("Invalid certificate params")
            .self_signed(&key)
            .expect("Failed to self-sign certificate");

        let config = load_server_config_from_pem(&cert.pem(), &key.serialize_pem())
            .expect("Failed to build TLS config");
        Self::spawn(Some(TlsAcceptor::from(Arc::new(config)))).await
    }

    async fn spawn(tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let state = State {
            requests: Arc::new(RwLock::new(Vec::new())),
            response: Arc::new(RwLock::new(CannedResponse {
                status: StatusCode::OK,
                body: b"OK".to_vec(),
                headers: Vec::new(),
            })),
        };

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => serve(stream, state).await,
                            Err(e) => tracing::debug!("Mock TLS handshake failed: {}", e),
                        },
                        None => serve(stream, state).await,
                    }
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the address as a string (e.g., "127.0.0.1:12345")
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.read().last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.read().len()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.state.response.write().status = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        self.state.response.write().body = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state
            .response
            .write()
            .headers
            .push((name.into(), value.into()));
    }
}

async fn serve<S>(stream: S, state: State)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(state.respond(req).await) }
    });

    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await;
}

impl State {
    async fn respond(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = req
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes().to_vec())
            .unwrap_or_default();

        self.requests.write().push(RecordedRequest {
            method,
            uri,
            headers,
            body,
        });

        let canned = self.response.read();
        let mut builder = Response::builder().status(canned.status);
        for (name, value) in &canned.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Full::new(Bytes::from(canned.body.clone())))
            .unwrap()
    }
}
