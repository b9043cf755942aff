//! QUIC tunnel transport using quinn
//!
//! A QUIC connection negotiating the `teleport` ALPN is one tunnel session.
//! The client opens the first bidirectional stream as its control stream and
//! writes a `LEASE` line on it; the relay answers on the same stream. Every
//! further bidirectional stream, opened by the relay, carries one proxied
//! HTTP exchange.
//!
//! Connections negotiating `h3` are HTTP/3 clients and are handed back
//! as-is for the HTTP surface to serve.

// Initialize rustls crypto provider once globally
// This MUST be called before any rustls/QUIC operations
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            // Provider already installed by another crate, this is fine
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicSession;
pub use listener::{Established, QuicIncoming, QuicListener};
pub use stream::QuicStream;

/// ALPN identifier negotiated by tunnel clients
pub const ALPN: &[u8] = b"teleport";

/// ALPN identifier negotiated by HTTP/3 clients
pub const H3_ALPN: &[u8] = b"h3";
