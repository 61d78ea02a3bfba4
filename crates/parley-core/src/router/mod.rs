//! Message router
//!
//! Resolves a destination through the agent directory, delivers a task to it
//! over the best available transport, and for roundtrips waits on a local
//! placeholder task until the exchange finishes.

mod resolve;
mod transport;

pub use resolve::resolve_target;
pub use transport::{relay, Connector, DefaultConnector, Endpoint, HttpTransport, Transport};
#[cfg(unix)]
pub use transport::SocketTransport;

use crate::config::RouterConfig;
use crate::directory::AgentDirectory;
use crate::error::{ParleyError, Result};
use crate::protocol::{clamp_priority, SendTaskRequest};
use crate::reply::{ReplyTarget, ReplyTracker};
use crate::tasks::{Message, Task, TaskError, TaskMetadata, TaskState, TaskStore};
use crate::types::{AgentRecord, SenderInfo};
use std::sync::Arc;
use std::time::Instant;

/// Whether the sender waits for the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Return once the receiver has accepted the task
    Oneway,
    /// Wait until the local placeholder reaches a terminal state
    Roundtrip,
}

/// Per-send options
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub priority: u8,
    pub mode: ResponseMode,
    pub in_reply_to: Option<String>,
    pub context_id: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            priority: crate::protocol::DEFAULT_PRIORITY,
            mode: ResponseMode::Oneway,
            in_reply_to: None,
            context_id: None,
        }
    }
}

impl SendOptions {
    pub fn roundtrip() -> Self {
        Self {
            mode: ResponseMode::Roundtrip,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = clamp_priority(priority);
        self
    }
}

/// A task handed to a remote agent
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Agent id of the receiver
    pub peer: String,
    pub endpoint: Endpoint,
    /// `socket` or `http`
    pub transport: &'static str,
    /// The receiver's task, as returned on acceptance
    pub remote_task: Task,
    /// Our placeholder, for roundtrips
    pub placeholder: Option<Task>,
}

/// Outbound routing for one agent
pub struct MessageRouter {
    identity: SenderInfo,
    directory: AgentDirectory,
    store: Arc<TaskStore>,
    connector: Arc<dyn Connector>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        identity: SenderInfo,
        directory: AgentDirectory,
        store: Arc<TaskStore>,
        connector: Arc<dyn Connector>,
        config: RouterConfig,
    ) -> Self {
        Self {
            identity,
            directory,
            store,
            connector,
            config,
        }
    }

    pub fn identity(&self) -> &SenderInfo {
        &self.identity
    }

    /// Resolve `target` against the live directory, excluding ourselves
    pub fn resolve(&self, target: &str) -> Result<AgentRecord> {
        let live: Vec<AgentRecord> = self
            .directory
            .list()?
            .into_iter()
            .filter(|r| r.agent_id != self.identity.id)
            .collect();
        resolve_target(target, &live)
    }

    /// Deliver and, for roundtrips, wait for the outcome
    pub fn send(&self, target: &str, message: Message, options: SendOptions) -> Result<Delivery> {
        let mut delivery = self.deliver(target, message, &options)?;
        if options.mode == ResponseMode::Roundtrip {
            let finished = self.await_completion(&delivery)?;
            delivery.placeholder = Some(finished);
        }
        Ok(delivery)
    }

    /// Resolve `target` and hand it the message
    ///
    /// For roundtrips a placeholder task is created on our own store first
    /// and its id travels as `sender_task_id`.
    pub fn deliver(&self, target: &str, message: Message, options: &SendOptions) -> Result<Delivery> {
        let record = self.resolve(target)?;
        let endpoint = Endpoint::from(&record);
        self.deliver_to(endpoint, message, options)
    }

    fn deliver_to(&self, endpoint: Endpoint, message: Message, options: &SendOptions) -> Result<Delivery> {
        let mut metadata = TaskMetadata {
            sender: Some(self.identity.clone()),
            response_expected: options.mode == ResponseMode::Roundtrip,
            sender_task_id: None,
            in_reply_to: options.in_reply_to.clone(),
        };

        let placeholder = match options.mode {
            ResponseMode::Roundtrip => {
                let created = self.store.create_outbound(message.clone(), metadata.clone());
                let started = self.store.start(&created.id, 0)?;
                metadata.sender_task_id = Some(started.id.clone());
                Some(started)
            }
            ResponseMode::Oneway => None,
        };

        let request = SendTaskRequest {
            message,
            metadata,
            context_id: options.context_id.clone(),
        };

        match self.send_with_fallback(&endpoint, &request, clamp_priority(options.priority)) {
            Ok((remote_task, transport)) => {
                tracing::info!(
                    peer = %endpoint.agent_id,
                    transport,
                    remote_task = %remote_task.id,
                    placeholder = ?placeholder.as_ref().map(|t| t.id.as_str()),
                    "message delivered"
                );
                Ok(Delivery {
                    peer: endpoint.agent_id.clone(),
                    endpoint,
                    transport,
                    remote_task,
                    placeholder,
                })
            }
            Err(e) => {
                if let Some(placeholder) = &placeholder {
                    if let Err(fail_err) = self.store.fail(&placeholder.id, TaskError::from(&e)) {
                        tracing::debug!(placeholder = %placeholder.id, error = %fail_err, "placeholder not failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Try each transport in order; only transport failures move on
    fn send_with_fallback(
        &self,
        endpoint: &Endpoint,
        request: &SendTaskRequest,
        priority: u8,
    ) -> Result<(Task, &'static str)> {
        let mut last_error = None;
        for transport in self.connector.transports(endpoint) {
            match transport.send_task(request, priority) {
                Ok(task) => return Ok((task, transport.name())),
                Err(e) if e.is_transport() => {
                    tracing::warn!(peer = %endpoint.agent_id, transport = transport.name(), error = %e, "transport failed, trying fallback");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ParleyError::transport("none", format!("{} advertises no endpoint", endpoint.agent_id))
        }))
    }

    fn get_with_fallback(&self, endpoint: &Endpoint, task_id: &str) -> Result<Task> {
        let mut last_error = None;
        for transport in self.connector.transports(endpoint) {
            match transport.get_task(task_id) {
                Ok(task) => return Ok(task),
                Err(e) if e.is_transport() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ParleyError::transport("none", format!("{} advertises no endpoint", endpoint.agent_id))
        }))
    }

    /// Wait until the placeholder is terminal, polling the receiver meanwhile
    ///
    /// A correlated reply can finish the placeholder directly; otherwise the
    /// receiver's task outcome is copied onto it. On timeout the placeholder
    /// is failed and the receiver's task is left alone.
    pub fn await_completion(&self, delivery: &Delivery) -> Result<Task> {
        let placeholder_id = delivery
            .placeholder
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or_else(|| ParleyError::TaskNotFound("no placeholder for oneway send".into()))?;
        let timeout = self.config.roundtrip_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            let local = self
                .store
                .get(&placeholder_id)
                .ok_or_else(|| ParleyError::TaskNotFound(placeholder_id.clone()))?;
            if local.status.is_terminal() {
                return Ok(local);
            }

            match self.get_with_fallback(&delivery.endpoint, &delivery.remote_task.id) {
                Ok(remote) if remote.status.is_terminal() => {
                    return self.settle(&placeholder_id, &remote);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(peer = %delivery.peer, error = %e, "poll failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let err = ParleyError::TaskTimeout {
                    task_id: placeholder_id.clone(),
                    waited: timeout,
                };
                tracing::warn!(peer = %delivery.peer, placeholder = %placeholder_id, "roundtrip timed out");
                // a reply may have landed since the last check
                if let Err(ParleyError::InvalidTransition { .. }) =
                    self.store.fail(&placeholder_id, TaskError::from(&err))
                {
                    if let Some(task) = self.store.get(&placeholder_id) {
                        return Ok(task);
                    }
                }
                return Err(err);
            }
            std::thread::sleep(self.config.poll_interval().min(deadline - now));
        }
    }

    /// Copy a terminal remote outcome onto the placeholder
    fn settle(&self, placeholder_id: &str, remote: &Task) -> Result<Task> {
        let result = match remote.status {
            TaskState::Completed => self.store.complete(placeholder_id, remote.artifacts.clone()),
            TaskState::Failed => self.store.fail_with_artifacts(
                placeholder_id,
                remote
                    .error
                    .clone()
                    .unwrap_or_else(|| TaskError::new("remote_failed", "remote task failed")),
                remote.artifacts.clone(),
            ),
            _ => self.store.cancel(placeholder_id),
        };
        match result {
            Ok(task) => Ok(task),
            // finished concurrently by a correlated reply
            Err(ParleyError::InvalidTransition { .. }) => self
                .store
                .get(placeholder_id)
                .ok_or_else(|| ParleyError::TaskNotFound(placeholder_id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Answer whoever is owed a reply
    ///
    /// The tracker entry is consumed; if delivery fails it is put back so the
    /// reply can be retried.
    pub fn reply(&self, replies: &ReplyTracker, text: &str, sender: Option<&str>) -> Result<Delivery> {
        let target = replies.take(sender)?;
        let options = SendOptions {
            in_reply_to: target.sender_task_id.clone(),
            ..SendOptions::default()
        };

        let endpoint = match self.directory.get(&target.sender.id) {
            Ok(Some(record)) => Endpoint::from(&record),
            _ => Endpoint::from(&target.sender),
        };

        match self.deliver_to(endpoint, Message::agent_text(text), &options) {
            Ok(delivery) => Ok(delivery),
            Err(e) => {
                restore(replies, target);
                Err(e)
            }
        }
    }
}

fn restore(replies: &ReplyTracker, target: ReplyTarget) {
    if let Err(e) = replies.record(target) {
        tracing::warn!(error = %e, "failed to restore reply target");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Artifact, TaskDirection};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    /// A remote agent's task store reachable in-process
    #[derive(Clone, Default)]
    struct Remote {
        store: Arc<TaskStore>,
        seen: Arc<Mutex<Vec<(SendTaskRequest, u8)>>>,
    }

    struct RemoteTransport {
        remote: Remote,
        name: &'static str,
        fail: bool,
    }

    impl Transport for RemoteTransport {
        fn name(&self) -> &'static str {
            self.name
        }

        fn send_task(&self, request: &SendTaskRequest, priority: u8) -> Result<Task> {
            if self.fail {
                return Err(ParleyError::transport(self.name, "connection refused"));
            }
            self.remote.seen.lock().push((request.clone(), priority));
            let task = self
                .remote
                .store
                .create(request.message.clone(), request.metadata.clone());
            self.remote.store.start(&task.id, 0)
        }

        fn get_task(&self, task_id: &str) -> Result<Task> {
            if self.fail {
                return Err(ParleyError::transport(self.name, "connection refused"));
            }
            self.remote
                .store
                .get(task_id)
                .ok_or_else(|| ParleyError::TaskNotFound(task_id.to_string()))
        }
    }

    struct FakeConnector {
        remote: Remote,
        socket_broken: bool,
    }

    impl Connector for FakeConnector {
        fn transports(&self, _endpoint: &Endpoint) -> Vec<Box<dyn Transport>> {
            vec![
                Box::new(RemoteTransport {
                    remote: self.remote.clone(),
                    name: "socket",
                    fail: self.socket_broken,
                }),
                Box::new(RemoteTransport {
                    remote: self.remote.clone(),
                    name: "http",
                    fail: false,
                }),
            ]
        }
    }

    struct Fixture {
        _dir: TempDir,
        router: MessageRouter,
        store: Arc<TaskStore>,
        remote: Remote,
    }

    fn fixture(socket_broken: bool, timeout_secs: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let directory = AgentDirectory::new(dir.path());
        let pid = std::process::id();

        let mut me = AgentRecord::new("claude", 8110, pid, PathBuf::from("/work"));
        me.agent_id = "claude-8110".into();
        let mut peer = AgentRecord::new("codex", 8120, pid, PathBuf::from("/work"));
        peer.agent_id = "codex-8120".into();
        directory.register(&me).unwrap();
        directory.register(&peer).unwrap();

        let remote = Remote::default();
        let store = Arc::new(TaskStore::new());
        let router = MessageRouter::new(
            SenderInfo::from_record(&me),
            directory,
            store.clone(),
            Arc::new(FakeConnector {
                remote: remote.clone(),
                socket_broken,
            }),
            RouterConfig {
                roundtrip_timeout_secs: timeout_secs,
                poll_interval_ms: 20,
                connect_timeout_ms: 100,
                ..RouterConfig::default()
            },
        );
        Fixture {
            _dir: dir,
            router,
            store,
            remote,
        }
    }

    #[test]
    fn test_oneway_returns_on_acceptance() {
        let f = fixture(false, 5);
        let delivery = f
            .router
            .send("codex", Message::user_text("ping"), SendOptions::default())
            .unwrap();
        assert_eq!(delivery.transport, "socket");
        assert!(delivery.placeholder.is_none());
        assert_eq!(delivery.remote_task.status, TaskState::Working);
        assert!(f.store.is_empty());

        let seen = f.remote.seen.lock();
        assert_eq!(seen[0].0.metadata.sender.as_ref().unwrap().id, "claude-8110");
        assert!(!seen[0].0.metadata.response_expected);
    }

    #[test]
    fn test_fallback_after_transport_failure() {
        let f = fixture(true, 5);
        let delivery = f
            .router
            .send("codex-8120", Message::user_text("ping"), SendOptions::default().with_priority(5))
            .unwrap();
        assert_eq!(delivery.transport, "http");
        assert_eq!(f.remote.seen.lock()[0].1, 5);
    }

    /// Takes the request, then loses the answer
    struct LostAnswer(Remote);

    impl Transport for LostAnswer {
        fn name(&self) -> &'static str {
            "socket"
        }

        fn send_task(&self, request: &SendTaskRequest, priority: u8) -> Result<Task> {
            self.0.seen.lock().push((request.clone(), priority));
            Err(ParleyError::response_lost("socket", "timed out"))
        }

        fn get_task(&self, task_id: &str) -> Result<Task> {
            Err(ParleyError::TaskNotFound(task_id.to_string()))
        }
    }

    struct LossyConnector(Remote);

    impl Connector for LossyConnector {
        fn transports(&self, _endpoint: &Endpoint) -> Vec<Box<dyn Transport>> {
            vec![
                Box::new(LostAnswer(self.0.clone())),
                Box::new(RemoteTransport {
                    remote: self.0.clone(),
                    name: "http",
                    fail: false,
                }),
            ]
        }
    }

    #[test]
    fn test_lost_answer_is_not_resent() {
        let f = fixture(false, 5);
        let router = MessageRouter::new(
            f.router.identity().clone(),
            f.router.directory.clone(),
            f.store.clone(),
            Arc::new(LossyConnector(f.remote.clone())),
            RouterConfig::default(),
        );

        let err = router
            .send("codex", Message::user_text("ping"), SendOptions::roundtrip())
            .unwrap_err();
        assert!(matches!(err, ParleyError::ResponseLost { .. }));
        // delivered once, never retried over http
        assert_eq!(f.remote.seen.lock().len(), 1);
        assert!(f.remote.store.is_empty());

        let placeholder = f.store.list().pop().unwrap();
        assert_eq!(placeholder.status, TaskState::Failed);
        assert_eq!(placeholder.error.unwrap().kind, "response_lost");
    }

    #[test]
    fn test_roundtrip_copies_remote_outcome() {
        let f = fixture(false, 5);
        let remote_store = f.remote.store.clone();
        let finisher = std::thread::spawn(move || {
            for _ in 0..100 {
                if let Some(task) = remote_store.inbound_in(TaskState::Working).first() {
                    remote_store
                        .complete(&task.id, vec![Artifact::text("pong")])
                        .unwrap();
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });

        let delivery = f
            .router
            .send("codex", Message::user_text("ping"), SendOptions::roundtrip())
            .unwrap();
        finisher.join().unwrap();

        let placeholder = delivery.placeholder.unwrap();
        assert_ne!(placeholder.id, delivery.remote_task.id);
        assert_eq!(placeholder.direction, TaskDirection::Outbound);
        assert_eq!(placeholder.status, TaskState::Completed);
        assert_eq!(placeholder.artifacts, vec![Artifact::text("pong")]);

        let seen = f.remote.seen.lock();
        assert_eq!(seen[0].0.metadata.sender_task_id.as_deref(), Some(placeholder.id.as_str()));
        assert!(seen[0].0.metadata.response_expected);
    }

    #[test]
    fn test_roundtrip_timeout_fails_placeholder_only() {
        let f = fixture(false, 0);
        let err = f
            .router
            .send("codex", Message::user_text("ping"), SendOptions::roundtrip())
            .unwrap_err();
        assert!(matches!(err, ParleyError::TaskTimeout { .. }));

        let placeholder = f.store.list().pop().unwrap();
        assert_eq!(placeholder.status, TaskState::Failed);
        assert_eq!(placeholder.error.unwrap().kind, "task_timeout");
        let remote = f.remote.store.list().pop().unwrap();
        assert_eq!(remote.status, TaskState::Working);
    }

    #[test]
    fn test_placeholder_finished_by_reply_wins() {
        let f = fixture(false, 5);
        let delivery = f
            .router
            .deliver("codex", Message::user_text("ping"), &SendOptions::roundtrip())
            .unwrap();
        let placeholder_id = delivery.placeholder.as_ref().unwrap().id.clone();
        f.store
            .complete(&placeholder_id, vec![Artifact::text("via reply")])
            .unwrap();

        let finished = f.router.await_completion(&delivery).unwrap();
        assert_eq!(finished.artifacts, vec![Artifact::text("via reply")]);
    }

    #[test]
    fn test_self_is_not_a_target() {
        let f = fixture(false, 5);
        assert!(matches!(
            f.router.resolve("claude"),
            Err(ParleyError::TargetNotFound { .. })
        ));
    }

    #[test]
    fn test_reply_uses_sender_task_id() {
        let f = fixture(false, 5);
        let dir = TempDir::new().unwrap();
        let replies = ReplyTracker::open(dir.path(), "claude-8110", Duration::from_secs(60)).unwrap();
        let sender = SenderInfo {
            id: "codex-8120".into(),
            agent_type: "codex".into(),
            endpoint: Some("http://127.0.0.1:8120".into()),
            socket_path: None,
        };
        replies
            .record(ReplyTarget::new(sender, Some("placeholder-1".into()), "t1".into()))
            .unwrap();

        f.router.reply(&replies, "pong", None).unwrap();
        let seen = f.remote.seen.lock();
        assert_eq!(seen[0].0.metadata.in_reply_to.as_deref(), Some("placeholder-1"));
        assert_eq!(seen[0].0.message.text(), "pong");
        assert!(replies.pending().unwrap().is_empty());
    }
}
