//! Error types for parley core
//!
//! One error enum for every backend operation. Router failures carry enough
//! detail (candidate lists, transport names) for the caller to retry a
//! different target or transport.

use std::time::Duration;
use thiserror::Error;

/// Result type for parley core operations
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Unified error type for parley core
#[derive(Error, Debug)]
pub enum ParleyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// PTY allocation or I/O error
    #[error("PTY error: {0}")]
    Pty(String),

    /// The wrapped command could not be started
    #[error("Failed to spawn '{command}': {reason}")]
    ProcessSpawn { command: String, reason: String },

    /// The wrapped process is gone; nothing more can be written to it
    #[error("Wrapped process has exited")]
    ProcessExited,

    /// No live agent matches the requested target
    #[error("No agent matches '{target}'{}", candidate_suffix(candidates))]
    TargetNotFound {
        target: String,
        candidates: Vec<String>,
    },

    /// More than one live agent matches a bare type
    #[error("'{target}' is ambiguous, use one of: {}", candidates.join(", "))]
    AmbiguousTarget {
        target: String,
        candidates: Vec<String>,
    },

    /// Sending to a resolved target failed on every transport tried
    #[error("Transport {transport} unavailable: {reason}")]
    TransportUnavailable { transport: String, reason: String },

    /// The request reached the transport but no answer came back; the
    /// receiver may already have accepted it
    #[error("Transport {transport} sent the request but got no answer: {reason}")]
    ResponseLost { transport: String, reason: String },

    /// The remote agent answered with an error status
    #[error("Remote agent returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// A roundtrip wait exceeded its bound
    #[error("Task {task_id} timed out after {}s", waited.as_secs())]
    TaskTimeout { task_id: String, waited: Duration },

    /// The wrapped agent refused the request (detected from its output)
    #[error("Agent refused: {0}")]
    AgentRefused(String),

    /// The wrapped CLI reported an execution error (detected from its output)
    #[error("CLI execution error: {0}")]
    CliExecution(String),

    /// Unknown task id
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A task state change that the lifecycle does not allow
    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// A generic reply was requested but nobody is owed one
    #[error("No pending reply target: {0}")]
    NoReplyTarget(String),

    /// Channel error (communication failure)
    #[error("Channel error: {0}")]
    Channel(String),
}

fn candidate_suffix(candidates: &[String]) -> String {
    if candidates.is_empty() {
        " (no live agents)".to_string()
    } else {
        format!(" (live agents: {})", candidates.join(", "))
    }
}

impl ParleyError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ParleyError::Config(msg.into())
    }

    /// Create a PTY error
    pub fn pty(msg: impl Into<String>) -> Self {
        ParleyError::Pty(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        ParleyError::Channel(msg.into())
    }

    /// Create a transport error
    pub fn transport(transport: impl Into<String>, reason: impl ToString) -> Self {
        ParleyError::TransportUnavailable {
            transport: transport.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an error for a request whose answer never arrived
    pub fn response_lost(transport: impl Into<String>, reason: impl ToString) -> Self {
        ParleyError::ResponseLost {
            transport: transport.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying on a fallback transport could help
    ///
    /// Only failures before the request left are retryable; a lost answer
    /// is not, since resending could deliver the message twice.
    pub fn is_transport(&self) -> bool {
        matches!(self, ParleyError::TransportUnavailable { .. })
    }

    /// Short machine-readable code, used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            ParleyError::Io(_) => "io",
            ParleyError::Config(_) => "config",
            ParleyError::Serialization(_) => "serialization",
            ParleyError::Pty(_) => "pty",
            ParleyError::ProcessSpawn { .. } => "process_spawn",
            ParleyError::ProcessExited => "process_exited",
            ParleyError::TargetNotFound { .. } => "target_not_found",
            ParleyError::AmbiguousTarget { .. } => "ambiguous_target",
            ParleyError::TransportUnavailable { .. } => "transport_unavailable",
            ParleyError::ResponseLost { .. } => "response_lost",
            ParleyError::Remote { .. } => "remote",
            ParleyError::TaskTimeout { .. } => "task_timeout",
            ParleyError::AgentRefused(_) => "agent_refused",
            ParleyError::CliExecution(_) => "cli_execution",
            ParleyError::TaskNotFound(_) => "task_not_found",
            ParleyError::InvalidTransition { .. } => "invalid_transition",
            ParleyError::NoReplyTarget(_) => "no_reply_target",
            ParleyError::Channel(_) => "channel",
        }
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        ParleyError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ParleyError {
    fn from(err: toml::de::Error) -> Self {
        ParleyError::Config(err.to_string())
    }
}

impl From<nix::Error> for ParleyError {
    fn from(err: nix::Error) -> Self {
        ParleyError::Io(std::io::Error::from(err))
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for ParleyError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        ParleyError::Channel(format!("Send error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = ParleyError::AmbiguousTarget {
            target: "codex".into(),
            candidates: vec!["codex-8120".into(), "codex-8121".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("codex-8120"));
        assert!(msg.contains("codex-8121"));
        assert_eq!(err.code(), "ambiguous_target");
    }

    #[test]
    fn test_lost_response_is_not_retryable() {
        assert!(ParleyError::transport("socket", "refused").is_transport());
        let lost = ParleyError::response_lost("socket", "timed out");
        assert!(!lost.is_transport());
        assert_eq!(lost.code(), "response_lost");
    }

    #[test]
    fn test_not_found_without_candidates() {
        let err = ParleyError::TargetNotFound {
            target: "gemini".into(),
            candidates: vec![],
        };
        assert!(err.to_string().contains("no live agents"));
    }

    #[test]
    fn test_transport_helper() {
        let err = ParleyError::transport("socket", "connection refused");
        assert!(err.is_transport());
        assert!(err.to_string().contains("socket"));
    }
}
