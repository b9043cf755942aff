//! Reverse proxy over tunnel connections
//!
//! Instead of dialing a backend address, each proxied request opens a new
//! logical connection through the matched session and runs one HTTP/1.1
//! exchange over it. The connection lives as long as the response body (or
//! the spliced upgrade) and is torn down through a cancellation token when
//! that is dropped.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::header::{CONNECTION, HOST, TE, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, Version};
use http_body::{Frame, SizeHint};
use hyper::client::conn::http1;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use teleport_transport::{SharedSession, TransportError};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that only apply to a single hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to open tunnel connection: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP handshake over tunnel failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("Upstream exchange failed: {0}")]
    Upstream(#[source] hyper::Error),

    #[error("No response from tunnel within {0:?}")]
    Timeout(Duration),

    #[error("Invalid host header: {0:?}")]
    InvalidHost(String),

    #[error("Tunnel switched protocols without an upgrade request")]
    UnexpectedUpgrade,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Bad Gateway");
        (status, reason).into_response()
    }
}

/// Forwards requests through tunnel sessions
#[derive(Debug, Clone)]
pub struct TunnelProxy {
    timeout: Duration,
}

impl Default for TunnelProxy {
    fn default() -> Self {
        Self::new(DEFAULT_PROXY_TIMEOUT)
    }
}

impl TunnelProxy {
    /// `timeout` bounds everything up to the response head
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn forward(
        &self,
        session: SharedSession,
        host: &str,
        mut req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response, ProxyError> {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();

        let upgrade = upgrade_protocol(req.headers());
        let inbound_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));
        let outbound = rewrite_request(req, host, upgrade, client_addr)?;

        let exchange = async {
            let conn = session.open_conn(token.clone()).await?;
            let (mut sender, connection) = http1::handshake(TokioIo::new(conn))
                .await
                .map_err(ProxyError::Handshake)?;

            let id = session.id();
            let driver_token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = connection.with_upgrades() => {
                        if let Err(e) = result {
                            debug!("Tunnel connection for session {} ended: {}", id, e);
                        }
                    }
                    _ = driver_token.cancelled() => {
                        trace!("Tunnel connection for session {} cancelled", id);
                    }
                }
            });

            sender
                .send_request(outbound)
                .await
                .map_err(ProxyError::Upstream)
        };

        let mut response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let inbound_upgrade = inbound_upgrade.ok_or(ProxyError::UnexpectedUpgrade)?;
            let outbound_upgrade = hyper::upgrade::on(&mut response);
            let protocol = response.headers().get(UPGRADE).cloned();

            tokio::spawn(splice(inbound_upgrade, outbound_upgrade, guard));

            let (mut parts, _) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            parts
                .headers
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            if let Some(protocol) = protocol {
                parts.headers.insert(UPGRADE, protocol);
            }
            return Ok(Response::from_parts(parts, Body::empty()));
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(
            parts,
            Body::new(GuardedBody::new(body, guard)),
        ))
    }
}

/// Copy bytes between an upgraded client connection and the tunnel
async fn splice(inbound: OnUpgrade, outbound: OnUpgrade, _guard: DropGuard) {
    let (client, tunnel) = match tokio::try_join!(inbound, outbound) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Protocol upgrade failed: {}", e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut tunnel = TokioIo::new(tunnel);
    match tokio::io::copy_bidirectional(&mut client, &mut tunnel).await {
        Ok((sent, received)) => {
            debug!(
                "Upgraded connection closed ({} bytes sent, {} bytes received)",
                sent, received
            );
        }
        Err(e) => debug!("Upgraded connection closed: {}", e),
    }
}

fn rewrite_request(
    req: Request<Body>,
    host: &str,
    upgrade: Option<HeaderValue>,
    client_addr: Option<SocketAddr>,
) -> Result<Request<Body>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    // Origin form: the Host header carries the authority
    parts.uri = parts
        .uri
        .path_and_query()
        .cloned()
        .map(Uri::from)
        .unwrap_or_else(|| Uri::from_static("/"));
    parts.version = match parts.version {
        Version::HTTP_10 => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let keep_trailers = accepts_trailers(&parts.headers);
    strip_hop_by_hop(&mut parts.headers);
    if keep_trailers {
        parts.headers.insert(TE, HeaderValue::from_static("trailers"));
    }
    if let Some(protocol) = upgrade {
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        parts.headers.insert(UPGRADE, protocol);
    }

    let host_value =
        HeaderValue::from_str(host).map_err(|_| ProxyError::InvalidHost(host.to_string()))?;
    parts.headers.insert(HOST, host_value);

    if let Some(addr) = client_addr {
        append_forwarded_for(&mut parts.headers, addr.ip());
    }

    Ok(Request::from_parts(parts, body))
}

/// The `Upgrade` value if the request asks to switch protocols
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = connection_tokens(headers).any(|t| t.eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Whether the request's `TE` lists `trailers`
fn accepts_trailers(headers: &HeaderMap) -> bool {
    header_tokens(headers, TE).any(|t| t.eq_ignore_ascii_case("trailers"))
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    header_tokens(headers, CONNECTION)
}

fn header_tokens(headers: &HeaderMap, name: HeaderName) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = connection_tokens(headers)
        .map(str::to_ascii_lowercase)
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let value = {
        let prior: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if prior.is_empty() {
            ip.to_string()
        } else {
            format!("{}, {}", prior.join(", "), ip)
        }
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Response body that keeps the tunnel connection alive until dropped
struct GuardedBody<B> {
    inner: B,
    _guard: DropGuard,
}

impl<B> GuardedBody<B> {
    fn new(inner: B, guard: DropGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<B> http_body::Body for GuardedBody<B>
where
    B: http_body::Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Session"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(
            upgrade_protocol(&headers),
            Some(HeaderValue::from_static("websocket"))
        );
    }

    #[test]
    fn test_rewrite_request() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/items?limit=5")
            .version(Version::HTTP_2)
            .header(HOST, "ignored")
            .header(CONNECTION, "close")
            .header("x-forwarded-for", "10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let client: SocketAddr = "203.0.113.7:4000".parse().unwrap();

        let out = rewrite_request(req, "app.example.com:8080", None, Some(client)).unwrap();

        assert_eq!(out.uri(), "/api/items?limit=5");
        assert_eq!(out.version(), Version::HTTP_11);
        assert_eq!(out.headers()[HOST], "app.example.com:8080");
        assert_eq!(out.headers()["x-forwarded-for"], "10.0.0.1, 203.0.113.7");
        assert!(!out.headers().contains_key(CONNECTION));
    }

    #[test]
    fn test_rewrite_keeps_http10_and_upgrade() {
        let req = Request::builder()
            .uri("http://app.example.com/ws")
            .version(Version::HTTP_10)
            .body(Body::empty())
            .unwrap();
        let out = rewrite_request(req, "app.example.com", None, None).unwrap();
        assert_eq!(out.uri(), "/ws");
        assert_eq!(out.version(), Version::HTTP_10);
        assert!(!out.headers().contains_key("x-forwarded-for"));

        let req = Request::builder()
            .uri("/ws")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let out = rewrite_request(
            req,
            "app.example.com",
            Some(HeaderValue::from_static("websocket")),
            None,
        )
        .unwrap();
        assert_eq!(out.headers()[CONNECTION], "upgrade");
        assert_eq!(out.headers()[UPGRADE], "websocket");
    }

    #[test]
    fn test_rewrite_keeps_te_trailers() {
        let req = Request::builder()
            .uri("/grpc.Service/Call")
            .header(TE, "trailers, deflate")
            .body(Body::empty())
            .unwrap();
        let out = rewrite_request(req, "app.example.com", None, None).unwrap();
        assert_eq!(out.headers()[TE], "trailers");

        let req = Request::builder()
            .uri("/")
            .header(TE, "deflate")
            .body(Body::empty())
            .unwrap();
        let out = rewrite_request(req, "app.example.com", None, None).unwrap();
        assert!(!out.headers().contains_key(TE));
    }

    #[test]
    fn test_error_status() {
        assert_eq!(
            ProxyError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::Transport(TransportError::ConnectionClosed).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
