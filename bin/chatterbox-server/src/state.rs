//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use chatterbox_core::{Orchestrator, SqliteStore};

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Runs turns; also owns the chat store handle.
    pub orchestrator: Orchestrator<SqliteStore>,
}

impl AppState {
    pub fn store(&self) -> &SqliteStore {
        self.orchestrator.store()
    }
}
