//! Parley Core - Backend library for parley
//!
//! This crate provides the UI-agnostic pieces of a parley agent:
//! - Session supervision (PTY, output buffer, idle detection, serialized input)
//! - Task store and lifecycle, artifact parsing
//! - Agent directory and reply tracking
//! - Message routing over Unix sockets and HTTP
//! - Configuration loading
//!
//! The wrapper binary and the server crate consume it through `AgentService`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  accept/send   ┌──────────────────┐   write    ┌─────────┐
//! │ HTTP / socket /  │ ─────────────→ │   AgentService   │ ─────────→ │  PTY    │
//! │ keyboard         │                │  TaskStore       │            │ session │
//! │                  │ ←───────────── │  MessageRouter   │ ←───────── │         │
//! └──────────────────┘   Task         └──────────────────┘ SessionEvent└─────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use parley_core::{AgentService, SendTaskRequest, Message};
//!
//! let task = service.accept(SendTaskRequest {
//!     message: Message::user_text("ping"),
//!     metadata: Default::default(),
//!     context_id: None,
//! }, 3)?;
//!
//! for event in events.iter() {
//!     service.on_event(&event);
//! }
//! ```

// Public API modules
pub mod error;
pub mod protocol;
pub mod types;

pub mod config;

// Session events published by the supervisor
pub mod events;

pub mod ansi;
pub mod collaborators;
pub mod directory;
pub mod input;
pub mod reply;
pub mod router;
pub mod storage;
pub mod supervisor;
pub mod tasks;

// Re-export commonly used types
pub use error::{ParleyError, Result};
pub use events::{EventBus, SessionEvent};
pub use types::{
    ActiveTransport, AgentRecord, AgentStatus, SenderInfo, SessionStatus, TransferDirection,
};

pub use config::{load_config, ParleyConfig, ProgramProfile};

pub use collaborators::{FileGuard, HistorySink, WriteDecision};
pub use directory::AgentDirectory;
pub use input::{InputScanner, ScanEvent};
pub use protocol::{SendTaskRequest, DEFAULT_PRIORITY, INTERRUPT_PRIORITY};
pub use reply::{ReplyTarget, ReplyTracker, AGENT_ID_ENV};
pub use router::{Connector, DefaultConnector, Delivery, MessageRouter, ResponseMode, SendOptions};
pub use supervisor::{Session, SessionSupervisor, SupervisorOptions};
pub use tasks::{Artifact, Message, Task, TaskState, TaskStore};

// Main service facade
pub mod service;
pub use service::AgentService;

/// Get the crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
