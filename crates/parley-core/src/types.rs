//! Core types shared across parley
//!
//! These types are serializable; they travel on the wire and sit in the
//! on-disk agent directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Readiness of a supervised session, as classified by idle detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Not spawned yet, or the process has died
    NotStarted,

    /// Output is flowing or no idle signal has been seen
    Processing,

    /// The wrapped process is waiting for input
    Ready,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "NOT_STARTED",
            SessionStatus::Processing => "PROCESSING",
            SessionStatus::Ready => "READY",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            SessionStatus::NotStarted => 0,
            SessionStatus::Processing => 1,
            SessionStatus::Ready => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionStatus::Processing,
            2 => SessionStatus::Ready,
            _ => SessionStatus::NotStarted,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent status as advertised in the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Ready,
    Processing,
    /// Blocked on a roundtrip to another agent
    Waiting,
    /// Shutting down
    Done,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Ready => "READY",
            AgentStatus::Processing => "PROCESSING",
            AgentStatus::Waiting => "WAITING",
            AgentStatus::Done => "DONE",
        }
    }
}

impl From<SessionStatus> for AgentStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Ready => AgentStatus::Ready,
            SessionStatus::Processing => AgentStatus::Processing,
            SessionStatus::NotStarted => AgentStatus::Done,
        }
    }
}

/// Which way an in-flight exchange is going
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Describes an in-flight send or receive on an agent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTransport {
    pub direction: TransferDirection,
    /// Agent on the other end
    pub peer: String,
    /// `socket` or `http`
    pub transport: String,
    pub started_at: i64,
}

/// One running wrapped process, as stored in the agent directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    pub port: u16,
    #[serde(default)]
    pub local_socket_path: Option<PathBuf>,
    pub pid: u32,
    pub working_directory: PathBuf,
    pub status: AgentStatus,
    #[serde(default)]
    pub active_transport: Option<ActiveTransport>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub updated_at: i64,
}

impl AgentRecord {
    /// Build a fresh record for a process that is starting up
    pub fn new(agent_type: &str, port: u16, pid: u32, working_directory: PathBuf) -> Self {
        Self {
            agent_id: Self::make_id(agent_type, &working_directory, pid),
            agent_type: agent_type.to_string(),
            port,
            local_socket_path: None,
            pid,
            working_directory,
            status: AgentStatus::Processing,
            active_transport: None,
            display_name: None,
            role: None,
            host: None,
            updated_at: now_millis(),
        }
    }

    /// Stable id for (type, working directory, pid)
    pub fn make_id(agent_type: &str, working_directory: &std::path::Path, pid: u32) -> String {
        let key = format!("{}\0{}\0{}", agent_type, working_directory.display(), pid);
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
        let hex = uuid.simple().to_string();
        format!("{}-{}", agent_type, &hex[..8])
    }

    /// The `type-port` shorthand
    pub fn port_alias(&self) -> String {
        format!("{}-{}", self.agent_type, self.port)
    }

    /// Network endpoint for HTTP transport
    pub fn endpoint(&self) -> String {
        let host = self.host.as_deref().unwrap_or("127.0.0.1");
        format!("http://{}:{}", host, self.port)
    }

    /// Every name this agent answers to
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases = vec![self.agent_id.clone(), self.port_alias()];
        if let Some(name) = &self.display_name {
            aliases.push(name.clone());
        }
        aliases
    }
}

/// Identity of the agent that sent a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl SenderInfo {
    /// Sender identity derived from a directory record
    pub fn from_record(record: &AgentRecord) -> Self {
        Self {
            id: record.agent_id.clone(),
            agent_type: record.agent_type.clone(),
            endpoint: Some(record.endpoint()),
            socket_path: record.local_socket_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_id_is_stable() {
        let a = AgentRecord::make_id("codex", std::path::Path::new("/src/app"), 42);
        let b = AgentRecord::make_id("codex", std::path::Path::new("/src/app"), 42);
        let c = AgentRecord::make_id("codex", std::path::Path::new("/src/app"), 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("codex-"));
        assert_eq!(a.len(), "codex-".len() + 8);
    }

    #[test]
    fn test_aliases() {
        let mut record = AgentRecord::new("claude", 8120, 1, PathBuf::from("/tmp"));
        record.display_name = Some("reviewer".into());
        let aliases = record.aliases();
        assert!(aliases.contains(&"claude-8120".to_string()));
        assert!(aliases.contains(&"reviewer".to_string()));
        assert_eq!(record.endpoint(), "http://127.0.0.1:8120");
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&AgentStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        assert_eq!(SessionStatus::from_u8(SessionStatus::Ready.to_u8()), SessionStatus::Ready);
    }
}
