//! Wire types shared by the HTTP routes, the socket listener and the
//! outbound transports

use crate::error::ParleyError;
use crate::reply::ReplyTarget;
use crate::tasks::{Message, Task, TaskMetadata};
use crate::types::SessionStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Plain write
pub const DEFAULT_PRIORITY: u8 = 3;

/// Interrupt the receiving session before writing
pub const INTERRUPT_PRIORITY: u8 = 5;

/// Clamp a requested priority into 1..=5
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(1, INTERRUPT_PRIORITY)
}

/// Body of `POST /tasks/send`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendTaskRequest {
    pub message: Message,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub agent_id: String,
    pub status: SessionStatus,
    /// Recent output tail, escape sequences removed
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEndpoints {
    pub http: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
}

/// Capability descriptor served at `/.well-known/agent.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
    pub agent_id: String,
    pub agent_type: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub skills: Vec<String>,
    pub endpoints: AgentEndpoints,
    pub working_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyTargetsResponse {
    pub agent_id: String,
    pub targets: Vec<ReplyTarget>,
}

/// Body of `POST /reply-targets/consume`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumeReplyRequest {
    /// Pick a specific pending sender instead of the most recent
    #[serde(default)]
    pub sender: Option<String>,
}

/// Body of `POST /send`: ask this agent to send on its own behalf
///
/// Roundtrips then keep their placeholder in the agent's own store, where a
/// correlated reply can find it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySendRequest {
    pub target: String,
    pub text: String,
    #[serde(default)]
    pub priority: Option<u8>,
    /// Wait for the outcome instead of returning on acceptance
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySendResponse {
    pub peer: String,
    pub transport: String,
    pub remote_task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<Task>,
}

/// Error body for both HTTP and socket responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub error: String,
    #[serde(default = "default_status")]
    pub status: u16,
}

fn default_status() -> u16 {
    500
}

impl WireError {
    pub fn from_error(err: &ParleyError) -> Self {
        Self {
            code: err.code().to_string(),
            error: err.to_string(),
            status: http_status(err),
        }
    }

    /// Rebuild a local error from a remote one
    pub fn into_error(self) -> ParleyError {
        match self.code.as_str() {
            "task_not_found" => ParleyError::TaskNotFound(
                self.error.trim_start_matches("Task not found: ").to_string(),
            ),
            _ => ParleyError::Remote {
                status: self.status,
                message: self.error,
            },
        }
    }
}

/// HTTP status for an error surfaced by a handler
pub fn http_status(err: &ParleyError) -> u16 {
    match err {
        ParleyError::TaskNotFound(_) | ParleyError::TargetNotFound { .. } => 404,
        ParleyError::InvalidTransition { .. } | ParleyError::AmbiguousTarget { .. } => 409,
        ParleyError::NoReplyTarget(_) => 404,
        ParleyError::TransportUnavailable { .. } | ParleyError::Remote { .. } => 502,
        ParleyError::ResponseLost { .. } => 504,
        _ => 500,
    }
}

/// Commands accepted on the local socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketCommand {
    Send,
    GetTask,
    ListTasks,
    CancelTask,
    Status,
    AgentCard,
    ReplyTargets,
    ConsumeReplyTarget,
    /// Outbound send by the receiving agent, see [`RelaySendRequest`]
    Relay,
}

/// One request line on the local socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketRequest {
    pub request_id: String,
    pub command: SocketCommand,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of the `send` socket command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketSendPayload {
    #[serde(flatten)]
    pub request: SendTaskRequest,
    #[serde(default)]
    pub priority: Option<u8>,
}

/// Payload of `get_task` and `cancel_task`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskIdPayload {
    pub id: String,
}

/// One response line on the local socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl SocketResponse {
    pub fn success(request_id: String, payload: serde_json::Value) -> Self {
        Self {
            request_id,
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(request_id: String, err: &ParleyError) -> Self {
        Self {
            request_id,
            ok: false,
            payload: None,
            error: Some(WireError::from_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_send_request_minimal_body() {
        let json = r#"{"message":{"role":"user","parts":[{"type":"text","text":"ping"}]}}"#;
        let request: SendTaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.message.text(), "ping");
        assert!(!request.metadata.response_expected);
    }

    #[test]
    fn test_socket_send_payload_flattened() {
        let json = r#"{"request_id":"r1","command":"send","payload":{"message":{"parts":[{"type":"text","text":"hi"}]},"metadata":{"response_expected":true},"priority":5}}"#;
        let request: SocketRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.command, SocketCommand::Send);
        let payload: SocketSendPayload = serde_json::from_value(request.payload).unwrap();
        assert_eq!(payload.priority, Some(5));
        assert!(payload.request.metadata.response_expected);
    }

    #[test]
    fn test_wire_error_round_trip_keeps_not_found() {
        let err = ParleyError::TaskNotFound("t1".into());
        let wire = WireError::from_error(&err);
        assert_eq!(wire.status, 404);
        assert!(matches!(wire.into_error(), ParleyError::TaskNotFound(_)));
    }

    #[test]
    fn test_relay_request_defaults() {
        let json = r#"{"request_id":"r2","command":"relay","payload":{"target":"codex","text":"review"}}"#;
        let request: SocketRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.command, SocketCommand::Relay);
        let relay: RelaySendRequest = serde_json::from_value(request.payload).unwrap();
        assert_eq!(relay.priority, None);
        assert!(!relay.wait);
    }

    #[test]
    fn test_priority_clamped() {
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_priority(9), 5);
        assert_eq!(clamp_priority(3), 3);
    }
}
