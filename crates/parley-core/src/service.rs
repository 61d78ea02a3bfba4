//! Agent service
//!
//! Ties one supervised session to its task store, directory record, reply
//! tracker and router. The HTTP routes, the socket listener and the wrapper's
//! keyboard loop all go through this type.

use crate::ansi::strip_ansi;
use crate::collaborators::FileGuard;
use crate::config::{ParleyConfig, ProgramProfile};
use crate::directory::AgentDirectory;
use crate::error::{ParleyError, Result};
use crate::events::SessionEvent;
use crate::protocol::{
    clamp_priority, AgentCard, AgentEndpoints, RelaySendRequest, RelaySendResponse,
    ReplyTargetsResponse, SendTaskRequest, StatusResponse, DEFAULT_PRIORITY, INTERRUPT_PRIORITY,
};
use crate::reply::{ReplyTarget, ReplyTracker};
use crate::router::{Connector, Delivery, MessageRouter, ResponseMode, SendOptions};
use crate::supervisor::Session;
use crate::tasks::{
    parse_output, Artifact, FileAction, Message, Part, Task, TaskError, TaskState, TaskStore,
};
use crate::types::{
    now_millis, ActiveTransport, AgentRecord, AgentStatus, SenderInfo, SessionStatus,
    TransferDirection,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Bytes of recent output reported by `status`
const STATUS_CONTEXT_BYTES: usize = 2000;

/// Everything one wrapped agent exposes
pub struct AgentService {
    record: AgentRecord,
    profile: ProgramProfile,
    session: Arc<dyn Session>,
    store: Arc<TaskStore>,
    directory: AgentDirectory,
    replies: ReplyTracker,
    router: MessageRouter,
    file_guard: Option<Arc<dyn FileGuard>>,
    /// A roundtrip is in flight; session status changes leave the record alone.
    /// Held across the check and the directory write.
    waiting: Mutex<bool>,
}

impl AgentService {
    /// Build the service for an already registered `record`
    pub fn new(
        record: AgentRecord,
        profile: ProgramProfile,
        session: Arc<dyn Session>,
        store: Arc<TaskStore>,
        config: &ParleyConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let directory = AgentDirectory::new(config.agents_dir());
        let replies = ReplyTracker::open(
            &config.replies_dir(),
            &record.agent_id,
            config.replies.retention(),
        )?;
        let router = MessageRouter::new(
            SenderInfo::from_record(&record),
            directory.clone(),
            store.clone(),
            connector,
            config.router.clone(),
        );
        Ok(Self {
            record,
            profile,
            session,
            store,
            directory,
            replies,
            router,
            file_guard: None,
            waiting: Mutex::new(false),
        })
    }

    pub fn with_file_guard(mut self, guard: Arc<dyn FileGuard>) -> Self {
        self.file_guard = Some(guard);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.record.agent_id
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn replies(&self) -> &ReplyTracker {
        &self.replies
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Accept an inbound message and hand it to the wrapped process
    ///
    /// Failures after the task exists are recorded on the task, which is
    /// returned as `failed`; only an unusable request is an `Err`.
    pub fn accept(&self, request: SendTaskRequest, priority: u8) -> Result<Task> {
        let priority = clamp_priority(priority);
        let SendTaskRequest {
            message,
            metadata,
            context_id,
        } = request;

        let correlated = match metadata.in_reply_to.as_deref() {
            Some(id) => self.land_reply(id, &message),
            None => false,
        };

        let task = self
            .store
            .create_in_context(message, metadata, context_id);
        tracing::info!(
            task_id = %task.id,
            sender = ?task.metadata.sender.as_ref().map(|s| s.id.as_str()),
            priority,
            "task accepted"
        );

        if let Some(reason) = self.check_files(&task.message) {
            tracing::warn!(task_id = %task.id, %reason, "file guard refused task");
            return self.store.fail(&task.id, TaskError::new("file_conflict", reason));
        }

        match &task.metadata.sender {
            Some(sender) if !correlated => {
                let target = ReplyTarget::new(
                    sender.clone(),
                    task.metadata.sender_task_id.clone(),
                    task.id.clone(),
                );
                if let Err(e) = self.replies.record(target) {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to record reply target");
                }
            }
            Some(_) => {}
            None if task.metadata.response_expected => {
                tracing::warn!(
                    task_id = %task.id,
                    "response expected but sender identity is missing, reply cannot be correlated"
                );
            }
            None => {}
        }

        let offset = self.session.output_offset();
        // an answer to a question resumes whatever was waiting on it
        for waiting in self.store.inbound_in(TaskState::InputRequired) {
            if let Err(e) = self.store.resume(&waiting.id, offset) {
                tracing::debug!(task_id = %waiting.id, error = %e, "resume skipped");
            }
        }
        let task = self.store.start(&task.id, offset)?;

        let text = self.injected_text(&task);
        let written = if priority >= INTERRUPT_PRIORITY {
            self.session.interrupt_then_write(text.as_bytes())
        } else {
            self.session.write(text.as_bytes())
        };

        match written {
            Ok(()) => Ok(task),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "write to session failed");
                self.store.fail(&task.id, TaskError::from(&e))
            }
        }
    }

    /// Complete our placeholder `id` with a reply's parts
    fn land_reply(&self, id: &str, message: &Message) -> bool {
        let Some(placeholder) = self.store.get(id) else {
            return false;
        };
        if placeholder.status.is_terminal() {
            return false;
        }
        match self.store.complete(id, parts_to_artifacts(&message.parts)) {
            Ok(_) => {
                tracing::info!(placeholder = %id, "correlated reply completed placeholder");
                true
            }
            Err(e) => {
                tracing::debug!(placeholder = %id, error = %e, "correlated reply ignored");
                false
            }
        }
    }

    fn check_files(&self, message: &Message) -> Option<String> {
        let guard = self.file_guard.as_ref()?;
        message.file_paths().into_iter().find_map(|path| {
            let decision = guard.validate_write(path, self.agent_id());
            if decision.allowed {
                None
            } else {
                Some(
                    decision
                        .reason
                        .unwrap_or_else(|| format!("{} is locked", path.display())),
                )
            }
        })
    }

    fn injected_text(&self, task: &Task) -> String {
        let mut text = task.message.text();
        if text.is_empty() {
            text = task
                .message
                .file_paths()
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" ");
        }
        match (&task.metadata.sender, self.profile.announce_sender) {
            (Some(sender), true) => format!("[from {}] {}", sender.id, text),
            _ => text,
        }
    }

    /// React to a supervisor event
    pub fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Output(_) => {}
            SessionEvent::StatusChanged { to, .. } => {
                if *to == SessionStatus::Ready {
                    self.complete_ready();
                }
                let waiting = self.waiting.lock();
                if !*waiting {
                    self.advertise(AgentStatus::from(*to));
                }
            }
            SessionEvent::Exited { code } => self.on_exit(*code),
        }
    }

    /// Settle every working task against one shared output snapshot
    fn complete_ready(&self) {
        let working = self.store.inbound_in(TaskState::Working);
        let Some(from) = working.iter().map(|t| t.output_offset).min() else {
            return;
        };
        let snapshot = self.session.output_since(from);

        for task in working {
            let parsed = parse_output(&snapshot, &task.message.text());
            let result = if let Some(detected) = &parsed.error {
                let err = detected.to_error();
                self.store.fail_with_artifacts(
                    &task.id,
                    TaskError::new(detected.kind.as_str(), err.to_string()),
                    parsed.artifacts,
                )
            } else if parsed.needs_input {
                self.store.require_input(&task.id, parsed.artifacts)
            } else {
                self.store.complete(&task.id, parsed.artifacts)
            };

            match result {
                Ok(done) => {
                    tracing::info!(task_id = %done.id, status = %done.status, "task settled");
                    if done.status == TaskState::Completed {
                        self.record_touched_files(&done);
                    }
                }
                // canceled while the output was being parsed
                Err(e) => tracing::debug!(task_id = %task.id, error = %e, "task not settled"),
            }
        }
    }

    fn record_touched_files(&self, task: &Task) {
        let Some(guard) = &self.file_guard else {
            return;
        };
        for artifact in &task.artifacts {
            if let Artifact::File { path, action } = artifact {
                guard.record_modification(path, self.agent_id(), *action);
            }
        }
    }

    fn on_exit(&self, code: Option<u32>) {
        tracing::info!(?code, agent_id = %self.agent_id(), "session ended, failing open tasks");
        let err = TaskError::from(&ParleyError::ProcessExited);
        for state in [TaskState::Submitted, TaskState::Working, TaskState::InputRequired] {
            for task in self.store.inbound_in(state) {
                if let Err(e) = self.store.fail(&task.id, err.clone()) {
                    tracing::debug!(task_id = %task.id, error = %e, "task already finished");
                }
            }
        }
        if let Err(e) = self.directory.unregister(self.agent_id()) {
            tracing::warn!(error = %e, "failed to unregister after exit");
        }
    }

    fn advertise(&self, status: AgentStatus) {
        if let Err(e) = self.directory.update_status(self.agent_id(), status) {
            tracing::warn!(?status, error = %e, "failed to update directory status");
        }
    }

    pub fn status(&self) -> StatusResponse {
        let tail = self.session.recent_output(STATUS_CONTEXT_BYTES);
        StatusResponse {
            agent_id: self.agent_id().to_string(),
            status: self.session.status(),
            context: strip_ansi(&String::from_utf8_lossy(&tail)),
        }
    }

    pub fn agent_card(&self) -> AgentCard {
        let name = if self.profile.name.is_empty() {
            self.record.agent_type.clone()
        } else {
            self.profile.name.clone()
        };
        AgentCard {
            agent_id: self.record.agent_id.clone(),
            agent_type: self.record.agent_type.clone(),
            name,
            aliases: self.record.aliases(),
            skills: self.profile.skills.clone(),
            endpoints: AgentEndpoints {
                http: self.record.endpoint(),
                socket: self.record.local_socket_path.clone(),
            },
            working_directory: self.record.working_directory.clone(),
        }
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.store
            .get(id)
            .ok_or_else(|| ParleyError::TaskNotFound(id.to_string()))
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.store.list()
    }

    /// Stop tracking a task; the wrapped process is not told
    pub fn cancel_task(&self, id: &str) -> Result<Task> {
        let task = self.store.cancel(id)?;
        tracing::info!(task_id = %id, "task canceled");
        Ok(task)
    }

    pub fn reply_targets(&self) -> Result<ReplyTargetsResponse> {
        Ok(ReplyTargetsResponse {
            agent_id: self.agent_id().to_string(),
            targets: self.replies.pending()?,
        })
    }

    pub fn consume_reply_target(&self, sender: Option<&str>) -> Result<ReplyTarget> {
        self.replies.take(sender)
    }

    /// Send `text` to another agent
    ///
    /// A roundtrip marks this agent `WAITING` in the directory until the
    /// placeholder settles.
    pub fn send(&self, target: &str, text: &str, priority: u8, mode: ResponseMode) -> Result<Delivery> {
        let options = SendOptions {
            mode,
            ..SendOptions::default()
        }
        .with_priority(priority);
        let mut delivery = self.router.deliver(target, Message::user_text(text), &options)?;
        if mode == ResponseMode::Oneway {
            return Ok(delivery);
        }

        {
            let mut waiting = self.waiting.lock();
            *waiting = true;
            let transport = ActiveTransport {
                direction: TransferDirection::Sending,
                peer: delivery.peer.clone(),
                transport: delivery.transport.to_string(),
                started_at: now_millis(),
            };
            if let Err(e) = self.directory.set_active_transport(self.agent_id(), Some(transport)) {
                tracing::warn!(error = %e, "failed to advertise active transport");
            }
            self.advertise(AgentStatus::Waiting);
        }

        let outcome = self.router.await_completion(&delivery);

        {
            let mut waiting = self.waiting.lock();
            *waiting = false;
            if let Err(e) = self.directory.set_active_transport(self.agent_id(), None) {
                tracing::warn!(error = %e, "failed to clear active transport");
            }
            self.advertise(AgentStatus::from(self.session.status()));
        }

        delivery.placeholder = Some(outcome?);
        Ok(delivery)
    }

    /// `send` on behalf of a client in this agent's session
    pub fn relay(&self, request: RelaySendRequest) -> Result<RelaySendResponse> {
        let mode = if request.wait {
            ResponseMode::Roundtrip
        } else {
            ResponseMode::Oneway
        };
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        let delivery = self.send(&request.target, &request.text, priority, mode)?;
        Ok(RelaySendResponse {
            peer: delivery.peer,
            transport: delivery.transport.to_string(),
            remote_task: delivery.remote_task,
            placeholder: delivery.placeholder,
        })
    }

    /// Answer the most recent pending sender, or the one named
    pub fn reply(&self, text: &str, sender: Option<&str>) -> Result<Delivery> {
        self.router.reply(&self.replies, text, sender)
    }

    /// Advertise `DONE`, then drop the directory record
    pub fn shutdown(&self) {
        self.advertise(AgentStatus::Done);
        if let Err(e) = self.directory.unregister(self.agent_id()) {
            tracing::warn!(error = %e, "failed to unregister");
        }
    }
}

fn parts_to_artifacts(parts: &[Part]) -> Vec<Artifact> {
    parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => Artifact::text(text.clone()),
            Part::File { path, .. } => Artifact::File {
                path: path.clone(),
                action: FileAction::Modified,
            },
            Part::Data { data } => Artifact::text(data.to_string()),
        })
        .collect()
}
