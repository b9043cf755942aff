//! Plain HTTP listener serving the dispatcher

use crate::dispatcher::ProxyDispatcher;
use crate::http3::Http3Server;
use crate::proxy::{TunnelProxy, DEFAULT_PROXY_TIMEOUT};
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use teleport_router::SessionRegistry;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid Alt-Svc value: {0:?}")]
    InvalidAltSvc(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// Canonical root host; requests for it get the registry listing
    pub root_host: String,
    /// Value of the `Alt-Svc` header set on every response
    pub alt_svc: String,
    pub proxy_timeout: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            root_host: "localhost".to_string(),
            alt_svc: r#"h3=":4443""#.to_string(),
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
        }
    }
}

pub struct HttpServer {
    config: HttpServerConfig,
    dispatcher: Arc<ProxyDispatcher>,
}

impl HttpServer {
    pub fn new(
        config: HttpServerConfig,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, HttpServerError> {
        let alt_svc = HeaderValue::from_str(&config.alt_svc)
            .map_err(|_| HttpServerError::InvalidAltSvc(config.alt_svc.clone()))?;
        let dispatcher = ProxyDispatcher::new(
            registry,
            config.root_host.clone(),
            alt_svc,
            TunnelProxy::new(config.proxy_timeout),
        );

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Every path and method goes to the dispatcher
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.dispatcher.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// The same router, for HTTP/3 connections arriving on the tunnel endpoint
    pub fn http3(&self) -> Http3Server {
        Http3Server::new(self.router())
    }

    pub async fn bind(&self) -> Result<TcpListener, HttpServerError> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;
        info!("HTTP server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve on `listener` until `shutdown` is cancelled
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), HttpServerError> {
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn dispatch(State(dispatcher): State<Arc<ProxyDispatcher>>, req: Request) -> Response {
    dispatcher.handle(req).await
}
