//! Task lifecycle
//!
//! - `types`: the task model and its state machine
//! - `store`: in-memory store enforcing the transitions
//! - `artifacts`: turns session output into artifacts and error signatures
//! - `history`: non-blocking hand-off of finished tasks

mod artifacts;
mod history;
mod store;
mod types;

pub use artifacts::{parse_output, DetectedError, ErrorSignature, ParsedOutput};
pub use history::{HistoryDispatcher, TracingHistory, HISTORY_QUEUE};
pub use store::TaskStore;
pub use types::{
    Artifact, FileAction, Message, Part, Role, Task, TaskDirection, TaskError, TaskMetadata,
    TaskState,
};
