use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cache::SessionCache;
use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorOptions, SessionCoordinator};
use crate::registry::ConnectionRegistry;
use crate::store::{MemoryRosterStore, MemoryUserDirectory, RosterStore, UserDirectory};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub registry: Arc<ConnectionRegistry>,
    pub cache: Arc<SessionCache>,
    /// Connecting users are recorded here with the name they connect with.
    pub directory: Arc<MemoryUserDirectory>,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
}

impl AppState {
    /// State backed by the in-memory roster store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryRosterStore::new()))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn RosterStore>) -> Self {
        let cache = Arc::new(SessionCache::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let directory = Arc::new(MemoryUserDirectory::new());
        let coordinator = SessionCoordinator::new(
            store,
            Arc::clone(&directory) as Arc<dyn UserDirectory>,
            Arc::clone(&cache),
            Arc::clone(&registry),
            CoordinatorOptions::from(&config),
        );
        Self {
            coordinator: Arc::new(coordinator),
            registry,
            cache,
            directory,
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Counts one open WebSocket for as long as it lives.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}
