//! Entry point for newly established tunnel sessions

use crate::heartbeat::HeartbeatMonitor;
use crate::lease::{LeaseCoordinator, LeaseOutcome};
use crate::ControlError;
use std::sync::Arc;
use std::time::Duration;
use teleport_router::SessionRegistry;
use teleport_transport::SharedSession;
use tracing::{debug, error};

/// Leases a hostname to each new session and keeps leased sessions under
/// heartbeat watch
pub struct TunnelHandler {
    leases: LeaseCoordinator,
    heartbeat: HeartbeatMonitor,
}

impl TunnelHandler {
    pub fn new(registry: Arc<SessionRegistry>, root_host: impl Into<String>) -> Self {
        Self {
            leases: LeaseCoordinator::new(registry.clone(), root_host),
            heartbeat: HeartbeatMonitor::new(registry),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.heartbeat = self.heartbeat.with_interval(interval);
        self
    }

    /// Lease a hostname for `session` and start its heartbeat if one was
    /// assigned.
    pub async fn handle_session(
        &self,
        session: SharedSession,
        candidates: &[String],
    ) -> Result<LeaseOutcome, ControlError> {
        debug!(
            "New session {} requesting {:?}",
            session.id(),
            candidates
        );

        let outcome = match self.leases.lease(session.clone(), candidates).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Lease failed for session {}: {}", session.id(), e);
                return Err(e);
            }
        };

        if let LeaseOutcome::Assigned(_) = outcome {
            self.heartbeat.spawn(session);
        }
        Ok(outcome)
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Stop all heartbeat monitors. Registry entries are left in place.
    pub fn shutdown(&self) {
        self.heartbeat.shutdown();
    }
}
