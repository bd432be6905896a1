use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sluice::{
    normalize_local_addr, parse_http_upstream, ClientConfig, HeaderKv, HostHeader, HttpTunnel,
    HttpTunnelOptions, HttpTunnelRequest, HttpUpstream, LogRecorder, TcpTunnel, TcpTunnelOptions,
};

/// Sluice - expose local services through a sluice server
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Expose local services through a sluice tunnel server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/sluice/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server control URL (e.g. https://tunnel.example.com)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Authtoken presented to the server
    #[arg(long, global = true)]
    authtoken: Option<String>,

    /// CA certificate trusted for the server's TLS certificate
    #[arg(long, global = true)]
    ca: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Expose a local HTTP service
    Http(HttpArgs),

    /// Expose a local TCP service
    Tcp(TcpArgs),
}

#[derive(Args, Debug)]
struct HttpArgs {
    /// Local service (e.g. 3000, 127.0.0.1:3000 or https://localhost:8443)
    #[arg(value_parser = parse_upstream_arg)]
    addr: HttpUpstream,

    /// Accept any certificate from an https:// local service
    #[arg(long)]
    upstream_tls_skip_verify: bool,

    /// Requested subdomain (random if omitted)
    #[arg(long, conflicts_with = "domain")]
    subdomain: Option<String>,

    /// Requested full domain under the server's tunnel domain
    #[arg(long)]
    domain: Option<String>,

    /// Require HTTP basic auth from visitors (user:password)
    #[arg(long)]
    basic_auth: Option<String>,

    /// Only allow visitors from this IP or CIDR (repeatable)
    #[arg(long = "allow-cidr")]
    allow_cidr: Vec<String>,

    /// Reject visitors from this IP or CIDR (repeatable)
    #[arg(long = "deny-cidr")]
    deny_cidr: Vec<String>,

    /// Only allow this HTTP method (repeatable)
    #[arg(long = "allow-method")]
    allow_method: Vec<String>,

    /// Only allow this exact path (repeatable)
    #[arg(long = "allow-path")]
    allow_path: Vec<String>,

    /// Only allow paths under this prefix (repeatable)
    #[arg(long = "allow-path-prefix")]
    allow_path_prefix: Vec<String>,

    /// Add a header to requests, "Name: value" (repeatable)
    #[arg(long = "request-header-add", value_parser = parse_header_kv)]
    request_header_add: Vec<HeaderKv>,

    /// Remove a header from requests (repeatable)
    #[arg(long = "request-header-remove")]
    request_header_remove: Vec<String>,

    /// Add a header to responses, "Name: value" (repeatable)
    #[arg(long = "response-header-add", value_parser = parse_header_kv)]
    response_header_add: Vec<HeaderKv>,

    /// Remove a header from responses (repeatable)
    #[arg(long = "response-header-remove")]
    response_header_remove: Vec<String>,

    /// Host header sent to the local service: preserve, rewrite, or a literal value
    #[arg(long, default_value = "preserve")]
    host_header: HostHeader,

    /// Log a summary of every request
    #[arg(long)]
    log_requests: bool,
}

#[derive(Args, Debug)]
struct TcpArgs {
    /// Local address to forward to (e.g. 5432 or 127.0.0.1:5432)
    addr: String,

    /// Requested public port (allocated by the server if omitted)
    #[arg(long)]
    remote_port: Option<u16>,
}

fn parse_upstream_arg(raw: &str) -> Result<HttpUpstream, String> {
    parse_http_upstream(raw).map_err(|e| e.to_string())
}

/// Parse a `Name: value` header flag
fn parse_header_kv(raw: &str) -> Result<HeaderKv, String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"Name: value\", got {:?}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing header name in {:?}", raw));
    }
    Ok(HeaderKv::new(name, value.trim()))
}

impl HttpArgs {
    fn into_options(self, authtoken: String) -> HttpTunnelOptions {
        let request = HttpTunnelRequest {
            authtoken,
            subdomain: self.subdomain.unwrap_or_default(),
            domain: self.domain.unwrap_or_default(),
            basic_auth: self.basic_auth.unwrap_or_default(),
            allow_cidr: self.allow_cidr,
            deny_cidr: self.deny_cidr,
            request_header_add: self.request_header_add,
            request_header_remove: self.request_header_remove,
            response_header_add: self.response_header_add,
            response_header_remove: self.response_header_remove,
            allow_method: self.allow_method,
            allow_path: self.allow_path,
            allow_path_prefix: self.allow_path_prefix,
        };

        HttpTunnelOptions {
            request,
            host_header: self.host_header,
            reconnect: true,
            upstream_scheme: self.addr.scheme,
            upstream_tls_skip_verify: self.upstream_tls_skip_verify,
            recorder: self
                .log_requests
                .then(|| Arc::new(LogRecorder) as Arc<dyn sluice::ExchangeRecorder>),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sluice=info".parse()?)
                .add_directive("sluice_common=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // CLI flags > ENV > config file > defaults
    let mut config = ClientConfig::load_and_resolve(cli.config.as_deref())
        .context("Failed to load client configuration")?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(authtoken) = cli.authtoken {
        config.authtoken = authtoken.trim().to_string();
    }
    if let Some(ca) = cli.ca {
        config.tls_ca = Some(ca);
    }

    let endpoint = config
        .endpoint()
        .with_context(|| format!("Invalid server URL {}", config.server_url))?;
    let server_host = endpoint.host.clone();
    let cancel = CancellationToken::new();

    tracing::info!("Connecting to {}", config.server_url);

    let result = match cli.command {
        Commands::Http(args) => {
            let upstream = args.addr.clone();
            let options = args.into_options(config.authtoken.clone());
            let mut tunnel = HttpTunnel::start(endpoint, upstream.addr(), options, &cancel)
                .await
                .context("Failed to open HTTP tunnel")?;

            println!("Forwarding {} -> {}", tunnel.url(), upstream);
            run_until_shutdown(&cancel, tunnel.wait()).await
        }
        Commands::Tcp(args) => {
            let local_addr = normalize_local_addr(&args.addr);
            let options = TcpTunnelOptions {
                authtoken: config.authtoken.clone(),
                remote_port: args.remote_port.unwrap_or(0),
            };
            let mut tunnel = TcpTunnel::start(endpoint, local_addr.clone(), options, &cancel)
                .await
                .context("Failed to open TCP tunnel")?;

            println!(
                "Forwarding tcp://{}:{} -> {}",
                server_host,
                tunnel.remote_port(),
                local_addr
            );
            run_until_shutdown(&cancel, tunnel.wait()).await
        }
    };

    match result {
        Ok(()) => {
            tracing::info!("Tunnel closed");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Tunnel failed")),
    }
}

/// Drive a tunnel until it ends or a shutdown signal arrives
async fn run_until_shutdown<F>(cancel: &CancellationToken, wait: F) -> Result<(), sluice::TunnelError>
where
    F: std::future::Future<Output = Result<(), sluice::TunnelError>>,
{
    tokio::pin!(wait);
    tokio::select! {
        result = &mut wait => result,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            cancel.cancel();
            wait.await
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
