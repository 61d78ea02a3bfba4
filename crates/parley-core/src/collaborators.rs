//! Optional collaborators consumed by the agent service
//!
//! Both are narrow contracts. The service behaves the same with or without a
//! file guard, apart from the guard calls themselves, and never blocks on a
//! history sink.

use crate::tasks::{FileAction, Task};
use std::path::Path;

/// Outcome of a file-safety check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl WriteDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Coordinates concurrent edits to shared files
pub trait FileGuard: Send + Sync {
    /// May `agent_id` write to `path`?
    fn validate_write(&self, path: &Path, agent_id: &str) -> WriteDecision;

    /// Note that `agent_id` touched `path`
    fn record_modification(&self, path: &Path, agent_id: &str, action: FileAction);
}

/// Audit storage for finished tasks
pub trait HistorySink: Send + Sync {
    fn record(&self, task: &Task);
}
