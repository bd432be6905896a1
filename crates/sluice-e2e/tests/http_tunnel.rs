//! HTTP tunnel end-to-end tests

use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;
use sluice::{HeaderKv, HostHeader, RecentExchanges, TunnelError, UpstreamScheme};
use sluice_e2e::{http_options, FlakyLink, MockHttpService, TestClient, TestServer, TestServerOptions};
use sluice_protocol::ErrorKind;

/// Initialize tracing and crypto provider for tests
fn init_test() {
    // Install rustls crypto provider (ignore if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("sluice=debug,sluice_server=debug,sluice_e2e=debug")
        .with_test_writer()
        .try_init();
}

/// GET `path` on the tunnel `id` through the server's HTTP plane
async fn get(server: &TestServer, id: &str, path: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("http://{}{}", server.http_addr, path))
        .header("Host", server.host_for(id))
        .send()
        .await
        .expect("HTTP request failed")
}

fn rejection_kind(result: Result<TestClient, TunnelError>) -> ErrorKind {
    match result {
        Err(TunnelError::Rejected(err)) => err.kind,
        Err(e) => panic!("expected a rejection, got {}", e),
        Ok(_) => panic!("expected a rejection, got a tunnel"),
    }
}

#[tokio::test]
async fn test_http_tunnel_basic_get() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(b"Hello from local service!".to_vec());

    let client = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Failed to open tunnel");

    let id = client.tunnel_id().expect("No tunnel id assigned");
    assert_eq!(client.url(), Some(server.url_for(&id)));
    assert_eq!(server.http_tunnel_count(), 1);

    let resp = get(&server, &id, "/test-path?q=1").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "Hello from local service!");

    let requests = mock.get_requests();
    assert_eq!(requests.len(), 1, "Expected 1 request, got {}", requests.len());
    let request = &requests[0];
    assert_eq!(request.method, "GET");
    assert_eq!(request.uri, "/test-path?q=1");

    // Public host is preserved and forwarding headers describe the visitor
    let host = server.host_for(&id);
    assert_eq!(request.header("host"), Some(host.as_str()));
    assert_eq!(request.header("x-forwarded-for"), Some("127.0.0.1"));
    assert_eq!(request.header("x-forwarded-host"), Some(host.as_str()));
    assert_eq!(request.header("x-forwarded-proto"), Some("http"));
}

#[tokio::test]
async fn test_http_tunnel_post_with_body() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_status(StatusCode::CREATED);
    mock.set_response_body(br#"{"id": 123, "status": "created"}"#.to_vec());
    mock.add_response_header("Content-Type", "application/json");

    let client = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let resp = reqwest::Client::new()
        .post(format!("http://{}/api/users", server.http_addr))
        .header("Host", server.host_for(&id))
        .header("Content-Type", "application/json")
        .body(r#"{"name": "Test User", "email": "test@example.com"}"#)
        .send()
        .await
        .expect("HTTP request failed");

    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers()["content-type"], "application/json");
    assert!(resp.text().await.unwrap().contains("created"));

    let request = mock.last_request().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.uri, "/api/users");
    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("Test User"));
    assert!(body.contains("test@example.com"));
}

#[tokio::test]
async fn test_http_tunnel_multiple_requests_share_tunnel() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let client = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let http_client = reqwest::Client::new();
    let mut pending = Vec::new();
    for i in 0..5 {
        let request = http_client
            .get(format!("http://{}/item/{}", server.http_addr, i))
            .header("Host", server.host_for(&id))
            .send();
        pending.push(request);
    }
    for request in pending {
        let resp = request.await.expect("HTTP request failed");
        assert_eq!(resp.status(), 200);
    }

    let mut uris: Vec<String> = mock.get_requests().into_iter().map(|r| r.uri).collect();
    uris.sort();
    assert_eq!(uris, vec!["/item/0", "/item/1", "/item/2", "/item/3", "/item/4"]);
}

#[tokio::test]
async fn test_unknown_tunnel_is_not_found() {
    init_test();

    let server = TestServer::start().await;
    let resp = get(&server, "nothing-here", "/").await;
    assert_eq!(resp.status(), 404);

    // Hosts outside the tunnel domain are not routed either
    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", "example.org")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_header_transforms() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.add_response_header("X-Powered-By", "mock");
    mock.add_response_header("X-Kept", "yes");

    let mut options = http_options("test-token");
    options.request.request_header_add = vec![HeaderKv::new("X-Env", "e2e")];
    options.request.request_header_remove = vec!["X-Debug".to_string()];
    options.request.response_header_add = vec![HeaderKv::new("X-Frame-Options", "DENY")];
    options.request.response_header_remove = vec!["x-powered-by".to_string()];

    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for(&id))
        .header("X-Debug", "1")
        .header("X-Env", "visitor")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("x-powered-by").is_none());
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
    assert_eq!(resp.headers()["x-kept"], "yes");

    let request = mock.last_request().unwrap();
    assert!(request.header("x-debug").is_none());
    // Added headers replace what the visitor sent
    assert_eq!(request.header_values("x-env"), vec!["e2e"]);
}

#[tokio::test]
async fn test_basic_auth() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let mut options = http_options("test-token");
    options.request.basic_auth = "admin:s3cret".to_string();
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let resp = get(&server, &id, "/private").await;
    assert_eq!(resp.status(), 401);
    let challenge = resp.headers()["www-authenticate"].to_str().unwrap().to_string();
    assert!(challenge.starts_with("Basic"), "unexpected challenge {}", challenge);

    let resp = reqwest::Client::new()
        .get(format!("http://{}/private", server.http_addr))
        .header("Host", server.host_for(&id))
        .basic_auth("admin", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(mock.request_count(), 0, "rejected visitors must not reach the service");

    let resp = reqwest::Client::new()
        .get(format!("http://{}/private", server.http_addr))
        .header("Host", server.host_for(&id))
        .basic_auth("admin", Some("s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Credentials stop at the server
    let request = mock.last_request().unwrap();
    assert!(request.header("authorization").is_none());
}

#[tokio::test]
async fn test_cidr_rules() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    // Loopback visitors are outside the allowlist
    let mut options = http_options("test-token");
    options.request.allow_cidr = vec!["10.0.0.0/8".to_string()];
    let outside = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");

    // Allowed by range but denied by address: deny wins
    let mut options = http_options("test-token");
    options.request.allow_cidr = vec!["127.0.0.0/8".to_string()];
    options.request.deny_cidr = vec!["127.0.0.1".to_string()];
    let denied = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");

    let mut options = http_options("test-token");
    options.request.allow_cidr = vec!["127.0.0.0/8".to_string()];
    let allowed = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");

    let resp = get(&server, &outside.tunnel_id().unwrap(), "/").await;
    assert_eq!(resp.status(), 403);
    let resp = get(&server, &denied.tunnel_id().unwrap(), "/").await;
    assert_eq!(resp.status(), 403);
    assert_eq!(mock.request_count(), 0);

    let resp = get(&server, &allowed.tunnel_id().unwrap(), "/").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.request_count(), 1);
}

#[tokio::test]
async fn test_forwarded_for_trusted_only_when_configured() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        trust_proxy_headers: true,
        ..Default::default()
    })
    .await;
    let mock = MockHttpService::start().await;

    let mut options = http_options("test-token");
    options.request.deny_cidr = vec!["203.0.113.0/24".to_string()];
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for(&id))
        .header("X-Forwarded-For", "203.0.113.9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", server.http_addr))
        .header("Host", server.host_for(&id))
        .header("X-Forwarded-For", "198.51.100.7")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_method_and_path_allowlists() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let mut options = http_options("test-token");
    options.request.allow_method = vec!["get".to_string()];
    options.request.allow_path = vec!["/health".to_string()];
    options.request.allow_path_prefix = vec!["/api/".to_string()];
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    assert_eq!(get(&server, &id, "/health").await.status(), 200);
    assert_eq!(get(&server, &id, "/api/users?page=1").await.status(), 200);
    // Blocked routes are indistinguishable from a missing tunnel
    assert_eq!(get(&server, &id, "/admin").await.status(), 404);
    assert_eq!(get(&server, &id, "/healthz").await.status(), 404);

    let resp = reqwest::Client::new()
        .delete(format!("http://{}/api/users", server.http_addr))
        .header("Host", server.host_for(&id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let uris: Vec<String> = mock.get_requests().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, vec!["/health", "/api/users?page=1"]);
}

#[tokio::test]
async fn test_local_service_down_is_bad_gateway() {
    init_test();

    let server = TestServer::start().await;

    // Bind and release a port so nothing is listening on it
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let local_addr = unused.local_addr().unwrap().to_string();
    drop(unused);

    let client = TestClient::http(server.endpoint(), &local_addr, http_options("test-token"))
        .await
        .expect("Failed to open tunnel");

    let resp = get(&server, &client.tunnel_id().unwrap(), "/").await;
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn test_https_local_service() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start_tls().await;
    mock.set_response_body(b"secure hello".to_vec());

    let mut options = http_options("test-token");
    options.upstream_scheme = UpstreamScheme::Https;
    options.upstream_tls_skip_verify = true;
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let resp = get(&server, &id, "/over-tls").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "secure hello");
    assert_eq!(mock.last_request().unwrap().uri, "/over-tls");
}

#[tokio::test]
async fn test_https_local_service_untrusted_certificate() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start_tls().await;

    // Self-signed and not skipped: the handshake fails and no request goes through
    let mut options = http_options("test-token");
    options.upstream_scheme = UpstreamScheme::Https;
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let resp = get(&server, &id, "/").await;
    assert_eq!(resp.status(), 502);
    assert_eq!(mock.request_count(), 0);
}

#[tokio::test]
async fn test_requested_subdomain_and_domain() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let mut options = http_options("test-token");
    options.request.subdomain = "My-App".to_string();
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    assert_eq!(client.tunnel_id().as_deref(), Some("my-app"));
    assert_eq!(client.url(), Some(server.url_for("my-app")));
    assert_eq!(get(&server, "my-app", "/").await.status(), 200);

    let mut options = http_options("test-token");
    options.request.domain = format!("https://docs.{}/", server.tunnel_domain);
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    assert_eq!(client.tunnel_id().as_deref(), Some("docs"));

    // A live tunnel id cannot be taken twice
    let mut options = http_options("test-token");
    options.request.subdomain = "docs".to_string();
    let result = TestClient::http(server.endpoint(), &mock.addr_string(), options).await;
    assert_eq!(rejection_kind(result), ErrorKind::RegistrationFailed);

    // Domains outside the tunnel domain are refused
    let mut options = http_options("test-token");
    options.request.domain = "docs.example.org".to_string();
    let result = TestClient::http(server.endpoint(), &mock.addr_string(), options).await;
    assert_eq!(rejection_kind(result), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_subdomain_reserved_for_its_token() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let mut options = http_options("test-token");
    options.request.subdomain = "demo".to_string();
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options.clone())
        .await
        .expect("Failed to open tunnel");
    drop(client);

    // The reservation outlives the tunnel
    wait_until(|| server.http_tunnel_count() == 0).await;

    let mut other = options.clone();
    other.request.authtoken = "other-token".to_string();
    let result = TestClient::http(server.endpoint(), &mock.addr_string(), other).await;
    assert_eq!(rejection_kind(result), ErrorKind::Unauthorized);

    let again = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Owner should get its subdomain back");
    assert_eq!(again.tunnel_id().as_deref(), Some("demo"));

    // Reservations made out of band count the same way
    server.store.seed_subdomain(2, "preset");
    let mut options = http_options("test-token");
    options.request.subdomain = "preset".to_string();
    let result = TestClient::http(server.endpoint(), &mock.addr_string(), options).await;
    assert_eq!(rejection_kind(result), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let result = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("bogus")).await;
    assert_eq!(rejection_kind(result), ErrorKind::Unauthorized);
    assert_eq!(server.http_tunnel_count(), 0);
}

#[tokio::test]
async fn test_static_auth_token() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        use_store: false,
        auth_token: Some("static-secret".to_string()),
        ..Default::default()
    })
    .await;
    let mock = MockHttpService::start().await;

    let result = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token")).await;
    assert_eq!(rejection_kind(result), ErrorKind::Unauthorized);

    let client = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("static-secret"))
        .await
        .expect("Static token should be accepted");
    assert_eq!(get(&server, &client.tunnel_id().unwrap(), "/").await.status(), 200);
}

#[tokio::test]
async fn test_concurrent_tunnel_limit() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        max_tunnels_per_token: 1,
        ..Default::default()
    })
    .await;
    let mock = MockHttpService::start().await;

    let first = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Failed to open tunnel");

    let result = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token")).await;
    assert_eq!(rejection_kind(result), ErrorKind::TooManyTunnels);

    // Limits are per token
    let _other = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("other-token"))
        .await
        .expect("Other token has its own budget");

    // Closing the tunnel frees the slot
    drop(first);
    wait_until(|| server.control.limiter().active(1) == 0).await;
    let _second = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Slot should be free again");
}

#[tokio::test]
async fn test_creation_rate_limit() {
    init_test();

    let server = TestServer::start_with(TestServerOptions {
        max_creates_per_minute: 2,
        ..Default::default()
    })
    .await;
    let mock = MockHttpService::start().await;

    let _a = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Failed to open tunnel");
    let _b = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Failed to open tunnel");

    let result = TestClient::http(server.endpoint(), &mock.addr_string(), http_options("test-token")).await;
    assert_eq!(rejection_kind(result), ErrorKind::RateLimited);
}

#[tokio::test]
async fn test_host_header_modes() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;

    let mut options = http_options("test-token");
    options.host_header = HostHeader::Rewrite;
    let rewrite = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");

    let mut options = http_options("test-token");
    options.host_header = HostHeader::Custom("internal.local".to_string());
    let custom = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");

    assert_eq!(get(&server, &rewrite.tunnel_id().unwrap(), "/").await.status(), 200);
    let request = mock.last_request().unwrap();
    assert_eq!(request.header("host"), Some(mock.addr_string().as_str()));

    assert_eq!(get(&server, &custom.tunnel_id().unwrap(), "/").await.status(), 200);
    let request = mock.last_request().unwrap();
    assert_eq!(request.header_values("host"), vec!["internal.local"]);
}

#[tokio::test]
async fn test_exchange_capture() {
    init_test();

    let server = TestServer::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_status(StatusCode::ACCEPTED);
    mock.set_response_body("captured body");

    let recent = RecentExchanges::new();
    let mut options = http_options("test-token");
    options.recorder = Some(Arc::new(recent.clone()));
    let client = TestClient::http(server.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();

    let resp = get(&server, &id, "/captured?x=1").await;
    assert_eq!(resp.status(), 202);
    assert_eq!(resp.text().await.unwrap(), "captured body");

    wait_until(|| recent.len() == 1).await;
    let exchange = recent.snapshot().remove(0);
    assert_eq!(exchange.method, "GET");
    assert_eq!(exchange.path, "/captured?x=1");
    assert_eq!(exchange.status, Some(202));
    assert_eq!(exchange.host, Some(server.host_for(&id)));
    assert!(exchange.bytes_in > 0);
    assert!(exchange.bytes_out > "captured body".len() as u64);
}

#[tokio::test]
async fn test_http_tunnel_resumes_after_disconnect() {
    init_test();

    let server = TestServer::start().await;
    let link = FlakyLink::start(server.http_addr).await;
    let mock = MockHttpService::start().await;

    let mut options = http_options("test-token");
    options.reconnect = true;
    let mut client = TestClient::http(link.endpoint(), &mock.addr_string(), options)
        .await
        .expect("Failed to open tunnel");
    let id = client.tunnel_id().unwrap();
    let url = client.url().unwrap();
    assert_eq!(get(&server, &id, "/before").await.status(), 200);

    link.sever();

    // Requests fail until the client has resumed
    let mut resumed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if link.accepted() >= 2 && get(&server, &id, "/after").await.status() == 200 {
            resumed = true;
            break;
        }
    }
    assert!(resumed, "tunnel {} did not come back", id);

    assert_eq!(client.tunnel_id(), Some(id));
    assert_eq!(client.url(), Some(url));
    assert_eq!(server.http_tunnel_count(), 1);
    assert!(client.wait_for(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_http_tunnel_without_reconnect_ends() {
    init_test();

    let server = TestServer::start().await;
    let link = FlakyLink::start(server.http_addr).await;
    let mock = MockHttpService::start().await;

    let mut client = TestClient::http(link.endpoint(), &mock.addr_string(), http_options("test-token"))
        .await
        .expect("Failed to open tunnel");

    link.sever();

    let ended = client
        .wait_for(Duration::from_secs(5))
        .await
        .expect("tunnel should end once its connection is gone");
    assert!(ended.is_err());
    wait_until(|| server.http_tunnel_count() == 0).await;
}

/// Poll `condition` for up to five seconds
async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}
