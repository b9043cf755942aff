//! Task tracking for per-session background tasks
//!
//! Keeps the JoinHandle of each session's monitor keyed by session id, so a
//! monitor can be aborted explicitly and every monitor can be stopped on
//! shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use teleport_transport::SessionId;
use tokio::task::JoinHandle;

/// Tracks background tasks associated with sessions
pub struct TaskTracker {
    tasks: Mutex<HashMap<SessionId, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `task` for session `id`, aborting any task already tracked for it.
    ///
    /// The handle is recorded before the task can call [`finish`](Self::finish).
    pub fn spawn<F>(&self, id: SessionId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        let handle = tokio::spawn(task);
        if let Some(old_handle) = tasks.insert(id, handle) {
            old_handle.abort();
        }
    }

    /// Abort the task for a session. Returns whether one was tracked.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget a task that is ending on its own
    pub fn finish(&self, id: SessionId) {
        self.lock().remove(&id);
    }

    /// Abort every tracked task
    pub fn abort_all(&self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
