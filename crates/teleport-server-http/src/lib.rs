//! Public HTTP surface of the relay
//!
//! Requests for the root host get a JSON listing of leased hostnames.
//! Requests for a leased hostname are proxied through that session's tunnel.
//! Everything else is a 404. Every response advertises HTTP/3 on the tunnel
//! endpoint in `Alt-Svc`, and [`Http3Server`] serves the same router there.

pub mod dispatcher;
pub mod http3;
pub mod proxy;
pub mod server;

pub use dispatcher::ProxyDispatcher;
pub use http3::{Http3Error, Http3Server};
pub use proxy::{ProxyError, TunnelProxy, DEFAULT_PROXY_TIMEOUT};
pub use server::{HttpServer, HttpServerConfig, HttpServerError};
