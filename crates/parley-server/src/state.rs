//! Server state management

use parley_core::AgentService;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AgentService>,
}

impl AppState {
    pub fn new(service: Arc<AgentService>) -> Self {
        Self { service }
    }
}
