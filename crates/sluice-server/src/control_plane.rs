use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use sluice_common::{MuxSession, MuxStream};
use sluice_protocol::{
    ControlCodec, ControlError, ControlRequest, ErrorKind, HttpTunnelRequest, HttpTunnelResponse,
    RawControlRequest, TcpTunnelRequest, TcpTunnelResponse, TunnelType,
};

use crate::limits::{ConcurrencyLimiter, TunnelSlot};
use crate::policy::AccessPolicy;
use crate::rate_limit::RateLimiter;
use crate::registry::{HttpTunnelEntry, RegistryError, TunnelRegistry};
use crate::router::{host_from_domain_input, is_dns_label, normalize_domain, tunnel_id_from_host};
use crate::store::{ReservationStore, TokenId, TokenResolver, TokenValidator};
use crate::tcp_plane::TcpPlane;

/// How long a new session may take to open its control stream
pub const CONTROL_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for the peer to read a rejection before the session is dropped
const REJECT_LINGER: Duration = Duration::from_secs(5);

type ControlStream = Framed<MuxStream, ControlCodec<RawControlRequest>>;

/// Knobs of the control handler
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub tunnel_domain: String,
    /// Static token checked when no validator is configured
    pub auth_token: Option<String>,
    /// Concurrent tunnels per token (0 = unlimited)
    pub max_tunnels_per_token: i64,
    /// Tunnel creations per token per minute (0 = unlimited)
    pub max_creates_per_minute: i64,
}

/// External services consulted by the control handler
#[derive(Default, Clone)]
pub struct Collaborators {
    pub validator: Option<Arc<dyn TokenValidator>>,
    pub resolver: Option<Arc<dyn TokenResolver>>,
    pub reservations: Option<Arc<dyn ReservationStore>>,
}

/// A tunnel identity that can be reserved for a token
#[derive(Debug, Clone, Copy)]
enum Reservable<'a> {
    Subdomain(&'a str),
    Port(u16),
}

impl Reservable<'_> {
    async fn owner(&self, store: &dyn ReservationStore) -> Result<Option<TokenId>, ControlError> {
        let owner = match self {
            Reservable::Subdomain(name) => store.reserved_subdomain_token_id(name).await,
            Reservable::Port(port) => store.reserved_tcp_port_token_id(*port).await,
        };
        owner.map_err(|e| {
            tracing::warn!("Reservation lookup for {:?} failed: {}", self, e);
            self.lookup_error()
        })
    }

    async fn reserve(&self, store: &dyn ReservationStore, token_id: TokenId) -> bool {
        let reserved = match self {
            Reservable::Subdomain(name) => store.reserve_subdomain(token_id, name).await,
            Reservable::Port(port) => store.reserve_tcp_port(token_id, *port).await,
        };
        reserved.is_ok()
    }

    fn lookup_error(&self) -> ControlError {
        match self {
            Reservable::Subdomain(_) => {
                ControlError::with_message(ErrorKind::InvalidRequest, "invalid subdomain")
            }
            Reservable::Port(_) => ControlError::new(ErrorKind::AuthError),
        }
    }

    fn claim_error(&self) -> ControlError {
        match self {
            Reservable::Subdomain(_) => {
                ControlError::with_message(ErrorKind::AllocationFailed, "failed to reserve subdomain")
            }
            Reservable::Port(_) => {
                ControlError::with_message(ErrorKind::AllocationFailed, "failed to reserve port")
            }
        }
    }
}

/// Admission granted to a control request
struct Admission {
    token_id: Option<TokenId>,
    /// Held for the lifetime of the tunnel
    _slot: TunnelSlot,
}

/// Server side of the control protocol
///
/// Each accepted session is driven through authentication, identity
/// resolution, limits and allocation, then kept alive for as long as the
/// tunnel it created.
pub struct ControlPlane {
    settings: ControlSettings,
    collaborators: Collaborators,
    registry: Arc<TunnelRegistry>,
    tcp_plane: Arc<TcpPlane>,
    limiter: Arc<ConcurrencyLimiter>,
    rate_limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        settings: ControlSettings,
        collaborators: Collaborators,
        registry: Arc<TunnelRegistry>,
        tcp_plane: Arc<TcpPlane>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Self::with_rate_limiter(
            settings,
            collaborators,
            registry,
            tcp_plane,
            RateLimiter::new(),
            shutdown,
        )
    }

    pub fn with_rate_limiter(
        settings: ControlSettings,
        collaborators: Collaborators,
        registry: Arc<TunnelRegistry>,
        tcp_plane: Arc<TcpPlane>,
        rate_limiter: Arc<RateLimiter>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            collaborators,
            registry,
            tcp_plane,
            limiter: ConcurrencyLimiter::new(),
            rate_limiter,
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// Drive one control session from first stream to teardown
    pub async fn handle_session(self: Arc<Self>, session: MuxSession, peer_addr: SocketAddr) {
        let stream = match tokio::time::timeout(CONTROL_STREAM_TIMEOUT, session.accept_stream()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!("Control session from {} ended before a stream: {}", peer_addr, e);
                session.close();
                return;
            }
            Err(_) => {
                tracing::warn!("Control stream from {} not opened in time", peer_addr);
                session.close();
                return;
            }
        };

        let mut control = Framed::new(stream, ControlCodec::<RawControlRequest>::new());
        let raw = match control.next().await {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => {
                tracing::warn!("Invalid control request from {}: {}", peer_addr, e);
                let err = ControlError::new(ErrorKind::Protocol);
                reject(control, &session, None, &err).await;
                return;
            }
            None => {
                tracing::debug!("Control stream from {} closed without a request", peer_addr);
                session.close();
                return;
            }
        };

        let tunnel_type = raw.tunnel_type();
        let token_id = match self.identify(raw.authtoken()).await {
            Ok(token_id) => token_id,
            Err(err) => {
                tracing::warn!("Rejected control request from {}: {}", peer_addr, err);
                reject(control, &session, tunnel_type, &err).await;
                return;
            }
        };

        // A malformed payload must not spend a slot or a creation token;
        // an unknown type is only reported once limits have been checked
        let decoded = match tunnel_type {
            Some(_) => match raw.into_request() {
                Ok(request) => Some(request),
                Err(err) => {
                    tracing::warn!("Rejected control request from {}: {}", peer_addr, err);
                    reject(control, &session, tunnel_type, &err).await;
                    return;
                }
            },
            None => None,
        };

        let admission = match self.admit(token_id) {
            Ok(admission) => admission,
            Err(err) => {
                tracing::warn!("Rejected control request from {}: {}", peer_addr, err);
                reject(control, &session, tunnel_type, &err).await;
                return;
            }
        };

        let Some(request) = decoded else {
            let err = ControlError::new(ErrorKind::UnsupportedType);
            tracing::warn!("Rejected control request from {}: {}", peer_addr, err);
            reject(control, &session, tunnel_type, &err).await;
            return;
        };

        match request {
            ControlRequest::Tcp(req) => {
                self.serve_tcp(control, session, req, admission, peer_addr)
                    .await
            }
            ControlRequest::Http(req) => {
                self.serve_http(control, session, req, admission, peer_addr)
                    .await
            }
        }
    }

    /// Authenticate `token` and resolve its identity
    async fn identify(&self, token: &str) -> Result<Option<TokenId>, ControlError> {
        self.authenticate(token).await?;
        self.resolve_token_id(token).await
    }

    /// Per-token concurrency cap, then creation rate limit
    fn admit(&self, token_id: Option<TokenId>) -> Result<Admission, ControlError> {
        let limit_key = token_id.unwrap_or(0);

        let slot = self
            .limiter
            .try_acquire(limit_key, self.settings.max_tunnels_per_token)
            .ok_or_else(|| ControlError::new(ErrorKind::TooManyTunnels))?;

        if !self
            .rate_limiter
            .allow(limit_key, self.settings.max_creates_per_minute)
        {
            return Err(ControlError::new(ErrorKind::RateLimited));
        }

        Ok(Admission {
            token_id,
            _slot: slot,
        })
    }

    async fn authenticate(&self, token: &str) -> Result<(), ControlError> {
        if let Some(validator) = &self.collaborators.validator {
            return match validator.validate_token(token).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(ControlError::new(ErrorKind::Unauthorized)),
                Err(e) => {
                    tracing::warn!("Token validation failed: {}", e);
                    Err(ControlError::new(ErrorKind::AuthError))
                }
            };
        }

        match self.settings.auth_token.as_deref() {
            Some(expected) if !expected.is_empty() => {
                let matches: bool = token.trim().as_bytes().ct_eq(expected.as_bytes()).into();
                if matches {
                    Ok(())
                } else {
                    Err(ControlError::new(ErrorKind::Unauthorized))
                }
            }
            _ => Ok(()),
        }
    }

    async fn resolve_token_id(&self, token: &str) -> Result<Option<TokenId>, ControlError> {
        let Some(resolver) = &self.collaborators.resolver else {
            return Ok(None);
        };

        match resolver.token_id(token).await {
            Ok(id) => Ok(id.filter(|id| *id > 0)),
            Err(e) => {
                tracing::warn!("Token resolution failed: {}", e);
                Err(ControlError::new(ErrorKind::AuthError))
            }
        }
    }

    /// The reservation store, when identities can be scoped to tokens
    fn reservations(&self) -> Option<&dyn ReservationStore> {
        self.collaborators.resolver.as_ref()?;
        self.collaborators.reservations.as_deref()
    }

    /// Claim `item` for `token_id`, or verify the token already owns it
    async fn claim(&self, item: Reservable<'_>, token_id: Option<TokenId>) -> Result<(), ControlError> {
        let Some(store) = self.reservations() else {
            return Ok(());
        };
        let token_id = token_id.ok_or_else(|| ControlError::new(ErrorKind::Unauthorized))?;

        match item.owner(store).await? {
            Some(owner) if owner == token_id => return Ok(()),
            Some(_) => return Err(ControlError::new(ErrorKind::Unauthorized)),
            None => {}
        }

        if item.reserve(store, token_id).await {
            tracing::info!("Reserved {:?} for token {}", item, token_id);
            return Ok(());
        }

        // Lost a race with another claim: the store decides who owns it
        match item.owner(store).await {
            Ok(Some(owner)) if owner == token_id => Ok(()),
            Ok(Some(_)) => Err(ControlError::new(ErrorKind::Unauthorized)),
            _ => Err(item.claim_error()),
        }
    }

    async fn serve_tcp(
        &self,
        mut control: ControlStream,
        session: MuxSession,
        req: TcpTunnelRequest,
        admission: Admission,
        peer_addr: SocketAddr,
    ) {
        let (listener, port) = match self.allocate_tcp(req.remote_port, admission.token_id).await {
            Ok(allocated) => allocated,
            Err(err) => {
                tracing::warn!("TCP allocation for {} failed: {}", peer_addr, err);
                reject(control, &session, Some(TunnelType::Tcp), &err).await;
                return;
            }
        };

        if let Err(e) = send_and_close(&mut control, TcpTunnelResponse::success(port)).await {
            tracing::warn!("Failed to send TCP response to {}: {}", peer_addr, e);
            session.close();
            return;
        }
        tracing::info!("TCP tunnel established: port {} for {}", port, peer_addr);

        let cancel = self.shutdown.child_token();
        self.tcp_plane
            .serve(listener, session.clone(), port, cancel.clone())
            .await;

        cancel.cancel();
        session.close();
        tracing::info!("TCP tunnel closed: port {}", port);
    }

    async fn allocate_tcp(
        &self,
        requested: u16,
        token_id: Option<TokenId>,
    ) -> Result<(tokio::net::TcpListener, u16), ControlError> {
        if requested != 0 {
            self.tcp_plane.check_requested(requested)?;
            self.claim(Reservable::Port(requested), token_id).await?;

            let listener = self.tcp_plane.bind(requested).await.map_err(|e| {
                tracing::debug!("Bind of requested port {} failed: {}", requested, e);
                ControlError::new(ErrorKind::PortUnavailable)
            })?;
            return Ok((listener, requested));
        }

        let (start, end) = self.tcp_plane.port_range()?;
        for port in start..=end {
            if self.reserved_by_other(port, token_id).await {
                continue;
            }
            if let Ok(listener) = self.tcp_plane.bind(port).await {
                return Ok((listener, port));
            }
        }
        Err(ControlError::new(ErrorKind::NoPortsAvailable))
    }

    async fn reserved_by_other(&self, port: u16, token_id: Option<TokenId>) -> bool {
        let Some(store) = self.reservations() else {
            return false;
        };
        match store.reserved_tcp_port_token_id(port).await {
            Ok(Some(owner)) => Some(owner) != token_id,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    async fn serve_http(
        &self,
        mut control: ControlStream,
        session: MuxSession,
        req: HttpTunnelRequest,
        admission: Admission,
        peer_addr: SocketAddr,
    ) {
        let prepared = match self.resolve_http_id(&req, admission.token_id).await {
            Ok(id) => AccessPolicy::from_request(&req)
                .map(|policy| (id, policy))
                .map_err(ControlError::from),
            Err(err) => Err(err),
        };
        let (id, policy) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::warn!("HTTP tunnel request from {} rejected: {}", peer_addr, err);
                reject(control, &session, Some(TunnelType::Http), &err).await;
                return;
            }
        };

        let entry = HttpTunnelEntry {
            id: id.clone(),
            session: Arc::new(session.clone()),
            policy,
        };
        if let Err(e) = self.registry.register(entry) {
            tracing::warn!("Failed to register tunnel {}: {}", id, e);
            let err = ControlError::new(ErrorKind::RegistrationFailed);
            reject(control, &session, Some(TunnelType::Http), &err).await;
            return;
        }

        let url = format!("https://{}.{}", id, normalize_domain(&self.settings.tunnel_domain));
        match send_and_close(&mut control, HttpTunnelResponse::success(&id, &url)).await {
            Ok(()) => {
                tracing::info!("HTTP tunnel established: {} for {}", url, peer_addr);
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = session.closed() => {}
                }
            }
            Err(e) => tracing::warn!("Failed to send HTTP response to {}: {}", peer_addr, e),
        }

        self.registry.unregister(&id);
        session.close();
        tracing::info!("HTTP tunnel closed: {}", id);
    }

    /// Pick the tunnel id for an HTTP request, claiming it when named
    async fn resolve_http_id(
        &self,
        req: &HttpTunnelRequest,
        token_id: Option<TokenId>,
    ) -> Result<String, ControlError> {
        let subdomain = req.subdomain.trim().to_ascii_lowercase();
        let domain = req.domain.trim();

        let desired = match (subdomain.is_empty(), domain.is_empty()) {
            (true, true) => {
                return self.registry.allocate_id().map_err(|e: RegistryError| {
                    tracing::warn!("Id allocation failed: {}", e);
                    ControlError::new(ErrorKind::AllocationFailed)
                });
            }
            (false, false) => return Err(ControlError::new(ErrorKind::InvalidRequest)),
            (false, true) => {
                if !is_dns_label(&subdomain) {
                    return Err(ControlError::with_message(
                        ErrorKind::InvalidRequest,
                        "invalid subdomain",
                    ));
                }
                subdomain
            }
            (true, false) => {
                let host = host_from_domain_input(domain);
                tunnel_id_from_host(&host, &self.settings.tunnel_domain)
                    .filter(|id| is_dns_label(id))
                    .ok_or_else(|| {
                        ControlError::with_message(ErrorKind::InvalidRequest, "invalid domain")
                    })?
            }
        };

        self.claim(Reservable::Subdomain(&desired), token_id).await?;
        Ok(desired)
    }
}

/// Write one response and close the control stream
async fn send_and_close<T: serde::Serialize>(
    control: &mut ControlStream,
    response: T,
) -> Result<(), sluice_protocol::CodecError> {
    control.send(response).await?;
    SinkExt::<T>::close(control).await
}

/// Answer with `err` on the schema of `tunnel_type` and drop the session
///
/// Requests whose type is unknown are answered on the TCP schema.
async fn reject(
    mut control: ControlStream,
    session: &MuxSession,
    tunnel_type: Option<TunnelType>,
    err: &ControlError,
) {
    let sent = match tunnel_type {
        Some(TunnelType::Http) => send_and_close(&mut control, HttpTunnelResponse::rejected(err)).await,
        _ => send_and_close(&mut control, TcpTunnelResponse::rejected(err)).await,
    };
    if let Err(e) = sent {
        tracing::debug!("Failed to send rejection: {}", e);
    }
    drop(control);

    // Give the peer a chance to read the answer and hang up first
    let _ = tokio::time::timeout(REJECT_LINGER, session.closed()).await;
    session.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use sluice_common::Role;
    use sluice_protocol::HeaderKv;

    struct Harness {
        plane: Arc<ControlPlane>,
        store: Arc<MemoryStore>,
        shutdown: CancellationToken,
    }

    fn settings() -> ControlSettings {
        ControlSettings {
            tunnel_domain: "tunnel.example.com".to_string(),
            auth_token: None,
            max_tunnels_per_token: 0,
            max_creates_per_minute: 0,
        }
    }

    fn harness_with(settings: ControlSettings, port_range: (u16, u16)) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.add_token("token-a", 1);
        store.add_token("token-b", 2);

        let collaborators = Collaborators {
            validator: Some(store.clone()),
            resolver: Some(store.clone()),
            reservations: Some(store.clone()),
        };
        let shutdown = CancellationToken::new();
        let plane = ControlPlane::new(
            settings,
            collaborators,
            TunnelRegistry::new(),
            TcpPlane::new("127.0.0.1".parse().unwrap(), port_range),
            shutdown.clone(),
        );
        Harness {
            plane,
            store,
            shutdown,
        }
    }

    fn harness() -> Harness {
        harness_with(settings(), (30000, 40000))
    }

    /// Connect a client session to the plane over an in-memory pipe
    fn connect(plane: &Arc<ControlPlane>) -> MuxSession {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::new(server_io, Role::Server);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        tokio::spawn(plane.clone().handle_session(server, peer));
        MuxSession::new(client_io, Role::Client)
    }

    async fn round_trip<Resp: serde::de::DeserializeOwned>(
        session: &MuxSession,
        request: &serde_json::Value,
    ) -> Resp {
        let stream = session.open_stream().await.unwrap();
        let mut framed = Framed::new(stream, ControlCodec::<Resp>::new());
        framed.send(request).await.unwrap();
        framed.next().await.unwrap().unwrap()
    }

    async fn http(session: &MuxSession, request: serde_json::Value) -> HttpTunnelResponse {
        round_trip(session, &request).await
    }

    async fn tcp(session: &MuxSession, request: serde_json::Value) -> TcpTunnelResponse {
        round_trip(session, &request).await
    }

    #[tokio::test]
    async fn test_http_tunnel_registers_and_unregisters() {
        let h = harness();
        let client = connect(&h.plane);

        let resp = http(&client, serde_json::json!({"type": "http", "authtoken": "token-a"})).await;
        assert_eq!(resp.error, None);
        assert_eq!(resp.id.len(), 8);
        assert_eq!(resp.url, format!("https://{}.tunnel.example.com", resp.id));
        assert!(h.plane.registry().contains(&resp.id));

        client.close();
        for _ in 0..100 {
            if !h.plane.registry().contains(&resp.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.plane.registry().contains(&resp.id));
    }

    #[tokio::test]
    async fn test_invalid_token_is_unauthorized() {
        let h = harness();
        let client = connect(&h.plane);

        let resp = http(&client, serde_json::json!({"type": "http", "authtoken": "nope"})).await;
        assert_eq!(resp.error.as_deref(), Some("unauthorized"));
        assert_eq!(resp.error_kind, Some(ErrorKind::Unauthorized));
    }

    #[tokio::test]
    async fn test_malformed_request_answered_on_tcp_schema() {
        let h = harness();
        let client = connect(&h.plane);

        let stream = client.open_stream().await.unwrap();
        let mut framed = Framed::new(stream, ControlCodec::<TcpTunnelResponse>::new());
        use tokio::io::AsyncWriteExt;
        framed.get_mut().write_all(b"{not json\n").await.unwrap();
        let resp = framed.next().await.unwrap().unwrap();

        assert_eq!(resp.tunnel_type, TunnelType::Tcp);
        assert_eq!(resp.error.as_deref(), Some("invalid request"));
        assert_eq!(resp.error_kind, Some(ErrorKind::Protocol));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected_after_auth() {
        let h = harness();

        let client = connect(&h.plane);
        let resp = tcp(&client, serde_json::json!({"type": "udp", "authtoken": "nope"})).await;
        assert_eq!(resp.error.as_deref(), Some("unauthorized"));

        let client = connect(&h.plane);
        let resp = tcp(&client, serde_json::json!({"type": "udp", "authtoken": "token-a"})).await;
        assert_eq!(resp.error.as_deref(), Some("unsupported tunnel type"));
    }

    #[tokio::test]
    async fn test_static_auth_token() {
        let mut settings = settings();
        settings.auth_token = Some("s3cret".to_string());
        let plane = ControlPlane::new(
            settings,
            Collaborators::default(),
            TunnelRegistry::new(),
            TcpPlane::with_default_bind((30000, 40000)),
            CancellationToken::new(),
        );

        let client = connect(&plane);
        let resp = http(&client, serde_json::json!({"type": "http", "authtoken": "wrong"})).await;
        assert_eq!(resp.error.as_deref(), Some("unauthorized"));

        let client = connect(&plane);
        let resp = http(&client, serde_json::json!({"type": "http", "authtoken": " s3cret "})).await;
        assert_eq!(resp.error, None);
    }

    #[tokio::test]
    async fn test_subdomain_reservation_is_exclusive() {
        let h = harness();

        let owner = connect(&h.plane);
        let resp = http(
            &owner,
            serde_json::json!({"type": "http", "authtoken": "token-a", "subdomain": "Demo"}),
        )
        .await;
        assert_eq!(resp.error, None);
        assert_eq!(resp.id, "demo");
        owner.close();

        let other = connect(&h.plane);
        let resp = http(
            &other,
            serde_json::json!({"type": "http", "authtoken": "token-b", "subdomain": "demo"}),
        )
        .await;
        assert_eq!(resp.error.as_deref(), Some("unauthorized"));

        // The owner can come back for it once the first tunnel is gone
        for _ in 0..100 {
            if !h.plane.registry().contains("demo") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let again = connect(&h.plane);
        let resp = http(
            &again,
            serde_json::json!({"type": "http", "authtoken": "token-a",
                "domain": "https://demo.tunnel.example.com/"}),
        )
        .await;
        assert_eq!(resp.error, None);
        assert_eq!(resp.id, "demo");
    }

    #[tokio::test]
    async fn test_invalid_http_identities() {
        let h = harness();

        let cases = [
            (serde_json::json!({"subdomain": "a", "domain": "a.tunnel.example.com"}), "invalid request"),
            (serde_json::json!({"subdomain": "bad_label"}), "invalid subdomain"),
            (serde_json::json!({"domain": "a.b.tunnel.example.com"}), "invalid domain"),
            (serde_json::json!({"domain": "a.other.com"}), "invalid domain"),
        ];
        for (mut body, expected) in cases {
            body["type"] = "http".into();
            body["authtoken"] = "token-a".into();
            let client = connect(&h.plane);
            let resp = http(&client, body).await;
            assert_eq!(resp.error.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_policy_errors_reject_request() {
        let h = harness();
        let client = connect(&h.plane);

        let resp = http(
            &client,
            serde_json::json!({"type": "http", "authtoken": "token-a",
                "request_header_add": [HeaderKv::new("Host", "evil")]}),
        )
        .await;
        assert_eq!(resp.error_kind, Some(ErrorKind::InvalidRequest));
        assert!(resp.error.unwrap().starts_with("invalid request_header_add"));
        assert!(h.plane.registry().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let mut settings = settings();
        settings.max_tunnels_per_token = 1;
        let h = harness_with(settings, (30000, 40000));

        let first = connect(&h.plane);
        let resp = http(&first, serde_json::json!({"type": "http", "authtoken": "token-a"})).await;
        assert_eq!(resp.error, None);
        assert_eq!(h.plane.limiter().active(1), 1);

        let second = connect(&h.plane);
        let resp = http(&second, serde_json::json!({"type": "http", "authtoken": "token-a"})).await;
        assert_eq!(resp.error.as_deref(), Some("too many active tunnels"));
        assert_eq!(resp.error_kind, Some(ErrorKind::TooManyTunnels));

        // Another token has its own budget
        let third = connect(&h.plane);
        let resp = http(&third, serde_json::json!({"type": "http", "authtoken": "token-b"})).await;
        assert_eq!(resp.error, None);

        first.close();
        for _ in 0..100 {
            if h.plane.limiter().active(1) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.plane.limiter().active(1), 0);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let mut settings = settings();
        settings.max_creates_per_minute = 1;
        let h = harness_with(settings, (30000, 40000));

        let first = connect(&h.plane);
        let resp = tcp(&first, serde_json::json!({"type": "tcp", "authtoken": "token-a"})).await;
        assert_eq!(resp.error, None);

        let second = connect(&h.plane);
        let resp = tcp(&second, serde_json::json!({"type": "tcp", "authtoken": "token-a"})).await;
        assert_eq!(resp.error.as_deref(), Some("rate limit exceeded"));
        assert!(resp.into_result().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_payload_spends_no_limits() {
        let mut settings = settings();
        settings.max_creates_per_minute = 1;
        settings.max_tunnels_per_token = 1;
        let h = harness_with(settings, (30000, 40000));

        let bad = connect(&h.plane);
        let resp = tcp(
            &bad,
            serde_json::json!({"type": "tcp", "authtoken": "token-a", "remote_port": "x"}),
        )
        .await;
        assert_eq!(resp.error_kind, Some(ErrorKind::InvalidRequest));
        assert_eq!(h.plane.limiter().active(1), 0);

        // Authentication still comes first
        let stranger = connect(&h.plane);
        let resp = tcp(
            &stranger,
            serde_json::json!({"type": "tcp", "authtoken": "nope", "remote_port": "x"}),
        )
        .await;
        assert_eq!(resp.error.as_deref(), Some("unauthorized"));

        let good = connect(&h.plane);
        let resp = tcp(&good, serde_json::json!({"type": "tcp", "authtoken": "token-a"})).await;
        assert_eq!(resp.error, None);
    }

    #[tokio::test]
    async fn test_tcp_requested_port_reserved_for_owner() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let h = harness_with(settings(), (port, port));

        let owner = connect(&h.plane);
        let resp = tcp(
            &owner,
            serde_json::json!({"type": "tcp", "authtoken": "token-a", "remote_port": port}),
        )
        .await;
        assert_eq!(resp.error, None);
        assert_eq!(resp.remote_port, port);
        assert_eq!(h.store.reserved_tcp_port_token_id(port).await.unwrap(), Some(1));

        let other = connect(&h.plane);
        let resp = tcp(
            &other,
            serde_json::json!({"type": "tcp", "authtoken": "token-b", "remote_port": port}),
        )
        .await;
        assert_eq!(resp.error.as_deref(), Some("unauthorized"));

        // Auto-allocation skips ports reserved by someone else
        let other = connect(&h.plane);
        let resp = tcp(&other, serde_json::json!({"type": "tcp", "authtoken": "token-b"})).await;
        assert_eq!(resp.error.as_deref(), Some("no ports available"));

        // Held by the owner's live tunnel
        let again = connect(&h.plane);
        let resp = tcp(
            &again,
            serde_json::json!({"type": "tcp", "authtoken": "token-a", "remote_port": port}),
        )
        .await;
        assert_eq!(resp.error.as_deref(), Some("requested port unavailable"));
        assert!(resp.into_result().unwrap_err().is_retryable());

        let out_of_range = connect(&h.plane);
        let resp = tcp(
            &out_of_range,
            serde_json::json!({"type": "tcp", "authtoken": "token-a", "remote_port": port.wrapping_add(1).max(1)}),
        )
        .await;
        assert!(resp.error.is_some());

        h.shutdown.cancel();
    }
}
