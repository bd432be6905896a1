use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sluice_server::{
    Collaborators, ControlPlane, ControlSettings, HttpPlane, HttpSettings, ServerConfig, TcpPlane,
    TunnelRegistry,
};

/// Tunnel server - accepts tunnel connections and routes traffic
#[derive(Parser, Debug)]
#[command(name = "sluice-server")]
#[command(about = "Self-hosted reverse tunnel server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sluice_server=info".parse()?)
                .add_directive("sluice_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tunnel server with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Tunnel domain: {}", config.tunnel_domain);
    tracing::info!("Listening address: {}", config.http_addr);
    tracing::info!(
        "TCP port range: {}-{} on {}",
        config.tcp_port_range.0,
        config.tcp_port_range.1,
        config.tcp_bind_addr
    );

    let tls_acceptor = match &config.tls {
        Some(files) => {
            let tls_config = sluice_common::load_server_config(&files.cert, &files.key)
                .context("Failed to load TLS configuration")?;
            tracing::info!("TLS enabled with certificate {}", files.cert.display());
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => {
            tracing::info!("TLS disabled (plain HTTP)");
            None
        }
    };

    let collaborators = match config.build_store() {
        Some(store) => {
            tracing::info!("Loaded {} tokens", store.token_count());
            let store = Arc::new(store);
            Collaborators {
                validator: Some(store.clone()),
                resolver: Some(store.clone()),
                reservations: Some(store),
            }
        }
        None => {
            if config.auth_token.is_none() {
                tracing::warn!("No tokens configured: every client is accepted");
            }
            Collaborators::default()
        }
    };

    let shutdown = CancellationToken::new();
    let registry = TunnelRegistry::new();
    let tcp_plane = TcpPlane::new(config.tcp_bind_addr, config.tcp_port_range);

    let control_plane = ControlPlane::new(
        ControlSettings {
            tunnel_domain: config.tunnel_domain.clone(),
            auth_token: config.auth_token.clone(),
            max_tunnels_per_token: config.max_tunnels_per_token,
            max_creates_per_minute: config.max_tunnel_creates_per_minute,
        },
        collaborators,
        registry,
        tcp_plane,
        shutdown.clone(),
    );

    let http_plane = HttpPlane::new(
        control_plane,
        HttpSettings {
            tunnel_domain: config.tunnel_domain.clone(),
            trust_proxy_headers: config.trust_proxy_headers,
        },
        tls_acceptor,
        shutdown.clone(),
    );

    tokio::select! {
        result = http_plane.run(config.http_addr) => {
            tracing::error!("HTTP plane stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    shutdown.cancel();
    tracing::info!("Server shutdown complete");
    Ok(())
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
