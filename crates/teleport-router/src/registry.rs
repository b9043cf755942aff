//! Session registry: canonical hostname -> live tunnel session
//!
//! One reader/writer lock guards both maps and the lease counter, so the
//! session map and the creation timestamps always hold the same keys. No
//! I/O happens while the lock is held.

use crate::hostname::{normalize, strip_port, HostnameError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use teleport_transport::{SessionId, SharedSession};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidHostname(#[from] HostnameError),
}

/// One registry entry as exposed by the listing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub host: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SharedSession>,
    created_at: HashMap<String, DateTime<Utc>>,
    /// Incremented on every `add`; seeds auto-generated hostnames
    counter: u64,
}

/// Concurrent map from hostname to tunnel session
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under `host`.
    ///
    /// An existing entry for the same host is overwritten; callers check
    /// availability beforehand.
    pub async fn add(&self, host: &str, session: SharedSession) -> Result<(), RegistryError> {
        let key = normalize(host)?;
        let id = session.id();

        let mut inner = self.inner.write().await;
        inner.counter += 1;
        if inner.sessions.insert(key.clone(), session).is_some() {
            debug!("Replaced existing session for {}", key);
        }
        inner.created_at.insert(key.clone(), Utc::now());
        drop(inner);

        trace!("Registered {} -> session {}", key, id);
        Ok(())
    }

    /// Look up the session serving `host`. `host` may carry a port, as an
    /// HTTP `Host` header does.
    pub async fn get(&self, host: &str) -> Option<SharedSession> {
        let key = match normalize(strip_port(host)) {
            Ok(key) => key,
            Err(e) => {
                trace!("Lookup of unroutable host: {}", e);
                return None;
            }
        };

        self.inner.read().await.sessions.get(&key).cloned()
    }

    /// Remove the entry for `host`. Removing an absent host is not an error.
    pub async fn remove(&self, host: &str) -> Result<(), RegistryError> {
        let key = normalize(host)?;

        let mut inner = self.inner.write().await;
        inner.sessions.remove(&key);
        inner.created_at.remove(&key);
        Ok(())
    }

    /// Remove every entry pointing at session `id` and return their hosts
    pub async fn remove_session(&self, id: SessionId) -> Vec<String> {
        let mut inner = self.inner.write().await;

        let hosts: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, session)| session.id() == id)
            .map(|(host, _)| host.clone())
            .collect();

        for host in &hosts {
            inner.sessions.remove(host);
            inner.created_at.remove(host);
        }
        drop(inner);

        for host in &hosts {
            info!("Recycled {}", host);
        }
        hosts
    }

    /// Snapshot of all entries, in no particular order
    pub async fn list(&self) -> Vec<Record> {
        let inner = self.inner.read().await;
        inner
            .created_at
            .iter()
            .map(|(host, created_at)| Record {
                host: host.clone(),
                created_at: *created_at,
            })
            .collect()
    }

    /// Number of successful `add` calls so far
    pub async fn counter(&self) -> u64 {
        self.inner.read().await.counter
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use teleport_transport::memory_session;

    fn session() -> SharedSession {
        let (session, _peer) = memory_session();
        session
    }

    async fn hosts(registry: &SessionRegistry) -> HashSet<String> {
        registry.list().await.into_iter().map(|r| r.host).collect()
    }

    #[tokio::test]
    async fn test_distinct_hosts_resolve_to_their_sessions() {
        let registry = SessionRegistry::new();
        let a = session();
        let b = session();

        registry.add("a.example.com", a.clone()).await.unwrap();
        registry.add("b.example.com", b.clone()).await.unwrap();

        assert_eq!(registry.get("a.example.com").await.unwrap().id(), a.id());
        assert_eq!(registry.get("b.example.com").await.unwrap().id(), b.id());
    }

    #[tokio::test]
    async fn test_get_strips_port_and_normalizes() {
        let registry = SessionRegistry::new();
        let s = session();

        registry.add("Bücher.example.com", s.clone()).await.unwrap();

        let found = registry.get("xn--bcher-kva.example.com:8443").await.unwrap();
        assert_eq!(found.id(), s.id());
        assert!(registry.get("BÜCHER.example.com").await.is_some());
        assert_eq!(
            hosts(&registry).await,
            HashSet::from(["xn--bcher-kva.example.com".to_string()])
        );
    }

    #[tokio::test]
    async fn test_get_missing_or_invalid() {
        let registry = SessionRegistry::new();
        assert!(registry.get("nope.example.com").await.is_none());
        assert!(registry.get("bad host").await.is_none());
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_key_set() {
        let registry = SessionRegistry::new();
        registry.add("keep.example.com", session()).await.unwrap();
        let before = hosts(&registry).await;

        registry.add("temp.example.com", session()).await.unwrap();
        registry.remove("temp.example.com").await.unwrap();

        assert_eq!(hosts(&registry).await, before);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let registry = SessionRegistry::new();
        registry.remove("ghost.example.com").await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_hostname_leaves_registry_untouched() {
        let registry = SessionRegistry::new();

        let err = registry.add("bad host", session()).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidHostname(_)));
        assert!(registry.remove("bad host").await.is_err());

        assert!(registry.is_empty().await);
        assert_eq!(registry.counter().await, 0);
    }

    #[tokio::test]
    async fn test_add_overwrites_and_counts() {
        let registry = SessionRegistry::new();
        let first = session();
        let second = session();

        registry.add("app.example.com", first).await.unwrap();
        registry.add("app.example.com", second.clone()).await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("app.example.com").await.unwrap().id(), second.id());
        assert_eq!(registry.counter().await, 2);
    }

    #[tokio::test]
    async fn test_remove_session_removes_all_aliases_only() {
        let registry = SessionRegistry::new();
        let target = session();
        let other = session();

        registry.add("one.example.com", target.clone()).await.unwrap();
        registry.add("two.example.com", target.clone()).await.unwrap();
        registry.add("other.example.com", other.clone()).await.unwrap();

        let mut removed = registry.remove_session(target.id()).await;
        removed.sort();
        assert_eq!(removed, vec!["one.example.com", "two.example.com"]);

        assert_eq!(
            hosts(&registry).await,
            HashSet::from(["other.example.com".to_string()])
        );
        assert_eq!(
            registry.get("other.example.com").await.unwrap().id(),
            other.id()
        );
        assert!(registry.remove_session(target.id()).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_timestamps() {
        let registry = SessionRegistry::new();
        let before = Utc::now();
        registry.add("a.example.com", session()).await.unwrap();

        let records = registry.list().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].created_at >= before);

        let json = serde_json::to_value(&records).unwrap();
        assert_eq!(json[0]["host"], "a.example.com");
        assert!(json[0]["created_at"].is_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds() {
        let registry = Arc::new(SessionRegistry::new());

        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .add(&format!("{}.example.com", i), session())
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len().await, 64);
        assert_eq!(registry.counter().await, 64);
    }
}
