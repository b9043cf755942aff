//! Tunnel control protocol definitions
//!
//! The control channel is a plain text protocol: one newline-terminated line
//! per message. The server writes `HOST`, `PING` and `ERR` lines; the client
//! opens the channel with a single `LEASE` line naming the subdomains it wants.

pub mod messages;

pub use messages::{ControlLine, LeaseRequest, ProtoError};

/// Reason sent in an `ERR` line when every requested subdomain is taken
pub const NO_AVAILABLE_SUBDOMAIN: &str = "none of your requested subdomains are currently available";

/// Upper bound on a single control line read from a client
pub const MAX_LINE_LEN: usize = 4096;
