//! Application state shared across all request handlers.

use questlog_core::chain::ConnectionState;
use questlog_core::persistence::PersistenceService;
use questlog_core::pipeline::Pipeline;
use std::sync::Arc;
use tokio::sync::watch;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PersistenceService>,
    pub pipeline: Pipeline,
    /// Latest connection state published by the chain watcher.
    pub watcher_state: watch::Receiver<ConnectionState>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn PersistenceService>,
        pipeline: Pipeline,
        watcher_state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            store,
            pipeline,
            watcher_state,
        }
    }

    pub fn watcher_state(&self) -> ConnectionState {
        *self.watcher_state.borrow()
    }
}
