//! Host-based routing for tunnel sessions
//!
//! Maps canonical hostnames to live tunnel sessions. Every key is stored in
//! ASCII (punycode) form without a port, so `Bücher.example.com:443` and
//! `xn--bcher-kva.example.com` address the same tunnel.

pub mod hostname;
pub mod registry;

pub use hostname::{normalize, strip_port, HostnameError};
pub use registry::{Record, RegistryError, SessionRegistry};
