//! Shared application state for the server.

use std::sync::Arc;

use crate::ai::AiClient;
use crate::db::Database;
use crate::definitions::WorkflowDefinitionService;
use crate::engine::OrchestrationEngine;
use crate::store::InstanceStore;

/// Shared state accessible by all API handlers.
pub struct AppStateInner {
    pub db: Database,
    pub definitions: Arc<WorkflowDefinitionService>,
    pub store: InstanceStore,
    pub engine: OrchestrationEngine,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(
        db: Database,
        definitions: Arc<WorkflowDefinitionService>,
        ai: Arc<dyn AiClient>,
    ) -> Self {
        let engine = OrchestrationEngine::new(
            definitions.clone(),
            InstanceStore::new(db.clone()),
            ai,
        );
        Self {
            store: InstanceStore::new(db.clone()),
            definitions,
            engine,
            db,
        }
    }
}
