//! Shared application state injected into every Axum handler.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use envhub_core::ImageBuilder;
use uuid::Uuid;

use crate::config::Config;
use crate::entities::SqliteStore;
use crate::orchestrator::BuildOrchestrator;
use crate::tail::LogTail;

/// Tracks which builds currently have a consumption loop attached.
#[derive(Default)]
pub struct TaskManager {
    in_flight: Mutex<HashSet<Uuid>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskManager({} in flight)", self.len())
    }
}

/// Removes its build from the [`TaskManager`] when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    uid: Uuid,
    manager: Arc<TaskManager>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.manager.in_flight.lock() {
            set.remove(&self.uid);
        }
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer for `uid`. `None` if one is already attached.
    pub fn register(self: &Arc<Self>, uid: Uuid) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(uid) {
            return None;
        }
        Some(InFlightGuard {
            uid,
            manager: Arc::clone(self),
        })
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }
}

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Build record store.
    pub store: Arc<SqliteStore>,
    /// Accepts, runs and deletes builds.
    pub orchestrator: Arc<BuildOrchestrator>,
    /// Read-side log streaming.
    pub log_tail: Arc<LogTail>,
}

impl AppState {
    /// Wire the orchestrator and the log tail around one store and builder.
    pub fn new(config: Config, store: SqliteStore, builder: Arc<dyn ImageBuilder>) -> Self {
        let store = Arc::new(store);
        let orchestrator = Arc::new(BuildOrchestrator::new(
            Arc::clone(&store),
            builder,
            config.build_idle_timeout,
        ));
        let log_tail = Arc::new(LogTail::new(
            Arc::clone(&store),
            config.log_poll_interval,
            config.log_stream_timeout,
        ));
        Self {
            config: Arc::new(config),
            store,
            orchestrator,
            log_tail,
        }
    }
}
