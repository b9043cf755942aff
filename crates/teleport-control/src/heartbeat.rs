//! Session liveness
//!
//! A leased session gets a `PING` line on its control stream every interval.
//! The client is not required to answer; a failed write is the only signal
//! that the tunnel is gone, and it evicts every registry entry of the session.

use crate::task_tracker::TaskTracker;
use std::sync::Arc;
use std::time::Duration;
use teleport_proto::ControlLine;
use teleport_router::SessionRegistry;
use teleport_transport::{SessionId, SharedSession, TunnelSession};
use tracing::{debug, info, warn};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

pub struct HeartbeatMonitor {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    tasks: Arc<TaskTracker>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            interval: DEFAULT_PING_INTERVAL,
            tasks: Arc::new(TaskTracker::new()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Watch `session` in a background task tracked by its id
    pub fn spawn(&self, session: SharedSession) {
        let id = session.id();
        let registry = self.registry.clone();
        let tasks = self.tasks.clone();
        let interval = self.interval;

        self.tasks.spawn(id, async move {
            watch_session(&registry, session.as_ref(), interval).await;
            tasks.finish(id);
        });
        debug!("Heartbeat started for session {}", id);
    }

    /// Ping `session` until a write fails, then evict it.
    ///
    /// Returns the hostnames that were removed.
    pub async fn watch(&self, session: SharedSession) -> Vec<String> {
        watch_session(&self.registry, session.as_ref(), self.interval).await
    }

    /// Stop watching a session without evicting it
    pub fn cancel(&self, id: SessionId) -> bool {
        self.tasks.cancel(id)
    }

    /// Number of sessions currently watched
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Abort every monitor
    pub fn shutdown(&self) {
        let count = self.tasks.len();
        self.tasks.abort_all();
        if count > 0 {
            info!("Stopped {} heartbeat monitor(s)", count);
        }
    }
}

async fn watch_session(
    registry: &SessionRegistry,
    session: &dyn TunnelSession,
    interval: Duration,
) -> Vec<String> {
    loop {
        if let Err(e) = session.controller().send(&ControlLine::Ping).await {
            warn!("Heartbeat to session {} failed: {}", session.id(), e);
            break;
        }
        tokio::time::sleep(interval).await;
    }

    registry.remove_session(session.id()).await
}
