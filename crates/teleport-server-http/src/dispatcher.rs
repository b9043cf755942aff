//! Host-based routing of inbound HTTP requests

use crate::proxy::TunnelProxy;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use http::header::{ALT_SVC, CONTENT_TYPE, HOST, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderValue, Method, Request, StatusCode, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use teleport_router::{strip_port, SessionRegistry};
use tracing::{debug, error, warn};

/// Routes each request to the registry listing, a tunnel, or 404
pub struct ProxyDispatcher {
    registry: Arc<SessionRegistry>,
    root_host: String,
    alt_svc: HeaderValue,
    proxy: TunnelProxy,
}

impl ProxyDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        root_host: impl Into<String>,
        alt_svc: HeaderValue,
        proxy: TunnelProxy,
    ) -> Self {
        Self {
            registry,
            root_host: root_host.into(),
            alt_svc,
            proxy,
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response {
        let mut response = self.route(req).await;
        response
            .headers_mut()
            .insert(ALT_SVC, self.alt_svc.clone());
        response
    }

    async fn route(&self, req: Request<Body>) -> Response {
        let Some(host) = request_host(&req).map(str::to_owned) else {
            debug!("No routable host for {} {}", req.method(), req.uri());
            return not_found();
        };

        if strip_port(&host).eq_ignore_ascii_case(&self.root_host) {
            return self.listing().await;
        }

        let Some(session) = self.registry.get(&host).await else {
            debug!("No tunnel for host {}", host);
            return not_found();
        };

        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        debug!(
            "Proxying {} {} for {} through session {}",
            req.method(),
            req.uri(),
            host,
            session.id()
        );
        match self.proxy.forward(session, &host, req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Proxy to {} failed: {}", host, e);
                e.into_response()
            }
        }
    }

    async fn listing(&self) -> Response {
        let records = self.registry.list().await;
        match serde_json::to_string_pretty(&records) {
            Ok(json) => (
                [(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                )],
                json,
            )
                .into_response(),
            Err(e) => {
                error!("Failed to serialize registry listing: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Host the request is addressed to.
///
/// Forward-proxy style requests (`CONNECT`, or an HTTP/1 absolute-form
/// target) are not routable. HTTP/2 carries the authority in the URI.
fn request_host(req: &Request<Body>) -> Option<&str> {
    if req.method() == Method::CONNECT {
        return None;
    }

    match req.version() {
        Version::HTTP_2 | Version::HTTP_3 => req
            .uri()
            .authority()
            .map(|a| a.as_str())
            .or_else(|| host_header(req)),
        _ if req.uri().scheme().is_some() => None,
        _ => host_header(req),
    }
}

fn host_header(req: &Request<Body>) -> Option<&str> {
    req.headers().get(HOST).and_then(|v| v.to_str().ok())
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [
            (
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            (X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
        ],
        "404 page not found\n",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, version: Version, host: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).version(version);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_request_host_from_header() {
        let req = request("/path", Version::HTTP_11, Some("app.example.com:8080"));
        assert_eq!(request_host(&req), Some("app.example.com:8080"));

        let req = request("/path", Version::HTTP_11, None);
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_request_host_http2_authority() {
        let req = request("https://app.example.com/path", Version::HTTP_2, None);
        assert_eq!(request_host(&req), Some("app.example.com"));
    }

    #[test]
    fn test_proxy_style_requests_are_unroutable() {
        let req = request("http://app.example.com/", Version::HTTP_11, Some("app.example.com"));
        assert_eq!(request_host(&req), None);

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("app.example.com:443")
            .header(HOST, "app.example.com:443")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_host(&req), None);
    }
}
