//! Teleport relay
//!
//! Leases public subdomains to tunnel clients connecting over QUIC and proxies
//! HTTP requests for those subdomains through their tunnels.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teleport_control::{LeaseOutcome, TunnelHandler};
use teleport_router::{normalize, SessionRegistry};
use teleport_server_http::{Http3Server, HttpServer, HttpServerConfig};
use teleport_transport::TunnelSession;
use teleport_transport_quic::{Established, QuicConfig, QuicIncoming, QuicListener};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

/// Time a rejected client gets to read its `ERR` line before the connection
/// is closed
const REJECT_GRACE: Duration = Duration::from_secs(1);

/// Teleport - expose local services through public subdomains
#[derive(Parser, Debug)]
#[command(name = "teleport")]
#[command(about = "Reverse-tunnel relay: leases subdomains and proxies HTTP through tunnels")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct ServerArgs {
    /// Root domain of this relay (e.g. "tunnel.example.com")
    /// Tunnels are served as {subdomain}.{domain}; the domain itself lists them
    #[arg(long, env = "TELEPORT_HOST")]
    domain: String,

    /// HTTP server bind address
    #[arg(long, env = "TELEPORT_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Tunnel listener bind address (QUIC, UDP)
    #[arg(long, env = "TELEPORT_TUNNEL_ADDR", default_value = "0.0.0.0:4443")]
    tunnel_addr: SocketAddr,

    /// TLS certificate file path (PEM format)
    #[arg(long, env = "TELEPORT_CERT")]
    tls_cert: PathBuf,

    /// TLS private key file path (PEM format)
    #[arg(long, env = "TELEPORT_KEY")]
    tls_key: PathBuf,

    /// Alt-Svc header value set on every HTTP response
    /// Defaults to h3=":<tunnel port>"
    #[arg(long, env = "TELEPORT_ALT_SVC")]
    alt_svc: Option<String>,

    /// Seconds between heartbeat pings on each control stream
    #[arg(long, default_value = "5")]
    ping_interval: u64,

    /// Seconds to wait for a tunnel to answer a proxied request
    #[arg(long, default_value = "30")]
    proxy_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging(&args.log_level)?;

    info!("Starting teleport relay {}", env!("GIT_TAG"));

    let root_host = normalize(&args.domain)
        .with_context(|| format!("Invalid --domain {:?}", args.domain))?;
    let alt_svc = args
        .alt_svc
        .clone()
        .unwrap_or_else(|| format!(r#"h3=":{}""#, args.tunnel_addr.port()));

    let registry = Arc::new(SessionRegistry::new());
    let handler = Arc::new(
        TunnelHandler::new(registry.clone(), root_host.clone())
            .with_ping_interval(Duration::from_secs(args.ping_interval)),
    );

    let http_server = HttpServer::new(
        HttpServerConfig {
            bind_addr: args.http_addr,
            root_host: root_host.clone(),
            alt_svc,
            proxy_timeout: Duration::from_secs(args.proxy_timeout),
        },
        registry.clone(),
    )
    .context("Failed to configure HTTP server")?;
    let http_listener = http_server.bind().await?;
    let http3 = http_server.http3();

    let quic_config = QuicConfig::server_default(&args.tls_cert, &args.tls_key);
    let quic_listener = QuicListener::new(args.tunnel_addr, Arc::new(quic_config))
        .context("Failed to start tunnel listener")?;

    info!("Relay is running for {}", root_host);
    info!("  - HTTP traffic: {}", args.http_addr);
    info!("  - Tunnels and HTTP/3: {} (QUIC)", args.tunnel_addr);
    info!("Press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    let http_shutdown = shutdown.clone();
    let mut http_handle =
        tokio::spawn(async move { http_server.serve(http_listener, http_shutdown).await });

    let quic_listener = Arc::new(quic_listener);
    let mut tunnel_handle = tokio::spawn(accept_tunnels(
        quic_listener.clone(),
        handler.clone(),
        http3,
    ));

    let outcome = tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping servers..."),
                Err(e) => error!("Error listening for shutdown signal: {}", e),
            }
            Ok(())
        }
        result = &mut http_handle => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("HTTP server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("HTTP server task panicked")),
            }
        }
        result = &mut tunnel_handle => {
            match result {
                Ok(()) => Err(anyhow::anyhow!("Tunnel listener closed unexpectedly")),
                Err(e) => Err(anyhow::Error::new(e).context("Tunnel listener task panicked")),
            }
        }
    };

    // Graceful shutdown
    shutdown.cancel();
    quic_listener.close();
    tunnel_handle.abort();
    handler.shutdown();
    if !http_handle.is_finished() {
        match tokio::time::timeout(Duration::from_secs(5), http_handle).await {
            Ok(Ok(Err(e))) => warn!("HTTP server stopped with error: {}", e),
            Ok(_) => {}
            Err(_) => warn!("HTTP server did not stop within 5s"),
        }
    }

    info!("Teleport relay stopped");
    outcome
}

/// Accept tunnel and HTTP/3 clients until the endpoint is closed
async fn accept_tunnels(
    listener: Arc<QuicListener>,
    handler: Arc<TunnelHandler>,
    http3: Http3Server,
) {
    while let Some(incoming) = listener.accept().await {
        let handler = handler.clone();
        let http3 = http3.clone();
        tokio::spawn(async move {
            handle_tunnel(incoming, &handler, &http3).await;
        });
    }
    debug!("Tunnel accept loop finished");
}

async fn handle_tunnel(incoming: QuicIncoming, handler: &TunnelHandler, http3: &Http3Server) {
    let remote_addr = incoming.remote_addr();
    debug!("Incoming QUIC connection from {}", remote_addr);

    let (session, request) = match incoming.establish().await {
        Ok(Established::Tunnel(session, request)) => (session, request),
        Ok(Established::Http3(conn)) => {
            if let Err(e) = http3.serve_connection(conn).await {
                debug!("HTTP/3 connection from {} failed: {}", remote_addr, e);
            }
            return;
        }
        Err(e) => {
            warn!("Tunnel handshake with {} failed: {}", remote_addr, e);
            return;
        }
    };
    info!(
        "Tunnel session {} established from {}",
        session.id(),
        remote_addr
    );

    match handler
        .handle_session(session.clone(), &request.candidates)
        .await
    {
        Ok(LeaseOutcome::Assigned(host)) => {
            info!("Session {} leased {}", session.id(), host);
        }
        Ok(LeaseOutcome::Rejected) => {
            tokio::time::sleep(REJECT_GRACE).await;
            session.close("no subdomain available");
        }
        Err(e) => {
            warn!("Dropping session {}: {}", session.id(), e);
            session.close("lease failed");
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
