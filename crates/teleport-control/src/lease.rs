//! Subdomain leasing
//!
//! A client either names the subdomains it wants, in order of preference, or
//! asks for any name. Named requests get the first free candidate or an
//! `ERR` line; anonymous requests always get `<counter>.<root>`.
//!
//! The availability check and the insert are separate registry operations,
//! so two sessions racing for the same free name can both be told `HOST`;
//! the later `add` wins the entry.

use crate::ControlError;
use std::sync::Arc;
use teleport_proto::{ControlLine, NO_AVAILABLE_SUBDOMAIN};
use teleport_router::{normalize, RegistryError, SessionRegistry};
use teleport_transport::SharedSession;
use tracing::{debug, info};

/// Result of a lease attempt that did not hit a local error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Session registered under this canonical hostname
    Assigned(String),
    /// Every requested candidate was taken; the client was sent `ERR`
    Rejected,
}

pub struct LeaseCoordinator {
    registry: Arc<SessionRegistry>,
    root_host: String,
}

impl LeaseCoordinator {
    /// `root_host` is expected in canonical form (see [`normalize`])
    pub fn new(registry: Arc<SessionRegistry>, root_host: impl Into<String>) -> Self {
        Self {
            registry,
            root_host: root_host.into(),
        }
    }

    pub async fn lease(
        &self,
        session: SharedSession,
        candidates: &[String],
    ) -> Result<LeaseOutcome, ControlError> {
        let mut selected = None;
        for prefix in candidates {
            let fullname = format!("{}.{}", prefix, self.root_host);
            if self.registry.get(&fullname).await.is_none() {
                selected = Some(fullname);
                break;
            }
            debug!("Subdomain {} is taken", fullname);
        }

        let fullname = match selected {
            Some(fullname) => fullname,
            None if !candidates.is_empty() => {
                let line = ControlLine::Err {
                    reason: NO_AVAILABLE_SUBDOMAIN.to_string(),
                    candidates: candidates.to_vec(),
                };
                session
                    .controller()
                    .send(&line)
                    .await
                    .map_err(ControlError::ControlStreamWrite)?;
                info!(
                    "Rejected lease for session {}: none of {:?} available",
                    session.id(),
                    candidates
                );
                return Ok(LeaseOutcome::Rejected);
            }
            None => format!("{}.{}", self.registry.counter().await, self.root_host),
        };

        let host = normalize(&fullname).map_err(RegistryError::from)?;

        session
            .controller()
            .send(&ControlLine::Host(host.clone()))
            .await
            .map_err(ControlError::ControlStreamWrite)?;

        self.registry.add(&host, session.clone()).await?;

        info!("Leased {} to session {}", host, session.id());
        Ok(LeaseOutcome::Assigned(host))
    }
}
