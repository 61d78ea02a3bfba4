//! Task data model
//!
//! These types are the wire representation as well as the in-memory one.

use crate::error::ParleyError;
use crate::types::{now_millis, SenderInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input_required",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `to`
    ///
    /// Monotonic apart from the `working <-> input_required` cycle.
    pub fn can_transition(&self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Submitted, Working) => true,
            (Working, InputRequired) | (InputRequired, Working) => true,
            (Working, Completed) | (InputRequired, Completed) => true,
            (from, Failed) | (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a task was received from another agent or is our own outbound placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskDirection {
    #[default]
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Agent,
}

/// One part of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text {
        text: String,
    },
    File {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Data {
        data: serde_json::Value,
    },
}

/// Role plus ordered parts
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    pub fn agent_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// Text parts joined by newlines
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Paths referenced by file parts
    pub fn file_paths(&self) -> Vec<&PathBuf> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::File { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Created,
    Modified,
    Deleted,
}

/// A structured segment extracted from a session's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Artifact {
    Text {
        text: String,
    },
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        code: String,
    },
    File {
        path: PathBuf,
        action: FileAction,
    },
    Error {
        kind: String,
        text: String,
    },
}

impl Artifact {
    pub fn text(text: impl Into<String>) -> Self {
        Artifact::Text { text: text.into() }
    }
}

/// Why a task failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&ParleyError> for TaskError {
    fn from(err: &ParleyError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Routing metadata carried with a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub sender: Option<SenderInfo>,
    #[serde(default)]
    pub response_expected: bool,
    /// Placeholder task id on the sender's own store
    #[serde(default)]
    pub sender_task_id: Option<String>,
    /// Task id this message answers
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

/// One tracked unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub context_id: Option<String>,
    pub status: TaskState,
    #[serde(default)]
    pub direction: TaskDirection,
    pub message: Message,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: i64,
    pub updated_at: i64,
    /// Session output offset when work started
    #[serde(skip)]
    pub output_offset: u64,
}

impl Task {
    pub fn new(message: Message, metadata: TaskMetadata, direction: TaskDirection) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context_id: None,
            status: TaskState::Submitted,
            direction,
            message,
            artifacts: Vec::new(),
            error: None,
            metadata,
            created_at: now,
            updated_at: now,
            output_offset: 0,
        }
    }

    /// Concatenated text artifacts
    pub fn artifact_text(&self) -> String {
        self.artifacts
            .iter()
            .filter_map(|a| match a {
                Artifact::Text { text } => Some(text.as_str()),
                Artifact::Code { code, .. } => Some(code.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
