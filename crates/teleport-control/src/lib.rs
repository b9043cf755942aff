//! Control plane for tunnel sessions
//!
//! Assigns public hostnames to new sessions, then watches each leased
//! session with a heartbeat and evicts it once its control stream breaks.

pub mod handler;
pub mod heartbeat;
pub mod lease;
pub mod task_tracker;

pub use handler::TunnelHandler;
pub use heartbeat::{HeartbeatMonitor, DEFAULT_PING_INTERVAL};
pub use lease::{LeaseCoordinator, LeaseOutcome};
pub use task_tracker::TaskTracker;

use teleport_router::RegistryError;
use teleport_transport::TransportError;
use thiserror::Error;

/// Errors that abort a session's setup or monitoring
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid hostname: {0}")]
    InvalidHostname(#[from] RegistryError),

    #[error("Control stream write failed: {0}")]
    ControlStreamWrite(#[source] TransportError),
}
