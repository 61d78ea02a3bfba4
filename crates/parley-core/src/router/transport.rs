//! Outbound transports
//!
//! A transport delivers a task-creation request to one resolved agent and
//! can query a task back. Local Unix sockets are preferred; HTTP is the
//! fallback. The candidate list is rebuilt from the directory record on every
//! send, so a socket that appears or disappears between sends is picked up.

use crate::config::RouterConfig;
use crate::error::{ParleyError, Result};
use crate::protocol::{
    RelaySendRequest, RelaySendResponse, SendTaskRequest, SocketCommand, SocketRequest,
    SocketResponse, SocketSendPayload, TaskIdPayload, TaskResponse, WireError, DEFAULT_PRIORITY,
};
use crate::tasks::Task;
use crate::types::{AgentRecord, SenderInfo};
use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;

/// One way of reaching a remote agent
pub trait Transport: Send + Sync {
    /// `socket` or `http`
    fn name(&self) -> &'static str;

    /// Ask the remote agent to create a task; returns the remote task
    fn send_task(&self, request: &SendTaskRequest, priority: u8) -> Result<Task>;

    /// Fetch a task from the remote agent's store
    fn get_task(&self, task_id: &str) -> Result<Task>;
}

/// Where a remote agent can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub agent_id: String,
    pub http: Option<String>,
    pub socket: Option<PathBuf>,
}

impl From<&AgentRecord> for Endpoint {
    fn from(record: &AgentRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            http: Some(record.endpoint()),
            socket: record.local_socket_path.clone(),
        }
    }
}

impl From<&SenderInfo> for Endpoint {
    fn from(sender: &SenderInfo) -> Self {
        Self {
            agent_id: sender.id.clone(),
            http: sender.endpoint.clone(),
            socket: sender.socket_path.clone(),
        }
    }
}

/// Builds the ordered transport candidates for an endpoint
pub trait Connector: Send + Sync {
    fn transports(&self, endpoint: &Endpoint) -> Vec<Box<dyn Transport>>;
}

/// Socket when the record advertises one that exists, then HTTP
pub struct DefaultConnector {
    timeout: Duration,
    response_timeout: Duration,
}

impl DefaultConnector {
    /// One timeout for connecting and for awaiting the answer
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            response_timeout: timeout,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
        }
    }
}

impl Connector for DefaultConnector {
    fn transports(&self, endpoint: &Endpoint) -> Vec<Box<dyn Transport>> {
        let mut transports: Vec<Box<dyn Transport>> = Vec::with_capacity(2);
        if let Some(path) = endpoint.socket.as_ref().filter(|p| p.exists()) {
            if let Some(socket) = socket_transport(path.clone(), self.timeout, self.response_timeout) {
                transports.push(socket);
            }
        }
        if let Some(url) = &endpoint.http {
            transports.push(Box::new(
                HttpTransport::new(url.clone(), self.timeout).with_response_timeout(self.response_timeout),
            ));
        }
        transports
    }
}

#[cfg(unix)]
fn socket_transport(path: PathBuf, timeout: Duration, response_timeout: Duration) -> Option<Box<dyn Transport>> {
    Some(Box::new(SocketTransport::new(path, timeout).with_response_timeout(response_timeout)))
}

#[cfg(not(unix))]
fn socket_transport(_path: PathBuf, _timeout: Duration, _response_timeout: Duration) -> Option<Box<dyn Transport>> {
    None
}

/// Hand a send to the running agent behind `record`, so the outbound task
/// and any placeholder live in that agent's store. The socket is tried
/// first; HTTP only when the socket could not be reached.
pub fn relay(record: &AgentRecord, request: &RelaySendRequest, config: &RouterConfig) -> Result<RelaySendResponse> {
    let mut response_timeout = config.response_timeout();
    if request.wait {
        response_timeout += config.roundtrip_timeout();
    }

    if let Some(result) = relay_over_socket(record, request, config.connect_timeout(), response_timeout) {
        match result {
            Err(e) if e.is_transport() => {
                tracing::debug!(agent_id = %record.agent_id, error = %e, "relay socket unavailable");
            }
            other => return other,
        }
    }

    HttpTransport::new(record.endpoint(), config.connect_timeout())
        .with_response_timeout(response_timeout)
        .relay(request)
}

#[cfg(unix)]
fn relay_over_socket(
    record: &AgentRecord,
    request: &RelaySendRequest,
    timeout: Duration,
    response_timeout: Duration,
) -> Option<Result<RelaySendResponse>> {
    let path = record.local_socket_path.as_ref().filter(|p| p.exists())?;
    let socket = SocketTransport::new(path.clone(), timeout).with_response_timeout(response_timeout);
    Some(socket.relay(request))
}

#[cfg(not(unix))]
fn relay_over_socket(
    _record: &AgentRecord,
    _request: &RelaySendRequest,
    _timeout: Duration,
    _response_timeout: Duration,
) -> Option<Result<RelaySendResponse>> {
    None
}

/// Newline-delimited JSON over a Unix socket
#[cfg(unix)]
pub struct SocketTransport {
    path: PathBuf,
    timeout: Duration,
    response_timeout: Duration,
}

#[cfg(unix)]
impl SocketTransport {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            response_timeout: timeout,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Ask the agent behind this socket to send on its own behalf
    pub fn relay(&self, request: &RelaySendRequest) -> Result<RelaySendResponse> {
        let payload = serde_json::to_value(request)?;
        Ok(serde_json::from_value(self.call(SocketCommand::Relay, payload)?)?)
    }

    fn call(&self, command: SocketCommand, payload: serde_json::Value) -> Result<serde_json::Value> {
        use std::os::unix::net::UnixStream;

        let unavailable = |e: std::io::Error| ParleyError::transport("socket", e);

        let mut stream = UnixStream::connect(&self.path).map_err(unavailable)?;
        stream.set_read_timeout(Some(self.response_timeout)).map_err(unavailable)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(unavailable)?;

        let request = SocketRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            command,
            payload,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        // the receiver acts only on a complete line, so a failed write is safe to retry
        stream.write_all(line.as_bytes()).map_err(unavailable)?;
        stream.flush().map_err(unavailable)?;

        let lost = |e: std::io::Error| ParleyError::response_lost("socket", e);
        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = reader.read_line(&mut response_line).map_err(lost)?;
        if read == 0 {
            return Err(ParleyError::response_lost("socket", "connection closed before response"));
        }

        let response: SocketResponse = serde_json::from_str(response_line.trim())?;
        if response.request_id != request.request_id {
            return Err(ParleyError::transport(
                "socket",
                format!("response id mismatch: {}", response.request_id),
            ));
        }
        if response.ok {
            Ok(response.payload.unwrap_or(serde_json::Value::Null))
        } else {
            Err(response
                .error
                .map(WireError::into_error)
                .unwrap_or_else(|| ParleyError::Remote {
                    status: 500,
                    message: "unknown socket error".to_string(),
                }))
        }
    }
}

#[cfg(unix)]
impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn send_task(&self, request: &SendTaskRequest, priority: u8) -> Result<Task> {
        let payload = serde_json::to_value(SocketSendPayload {
            request: request.clone(),
            priority: Some(priority),
        })?;
        let response: TaskResponse = serde_json::from_value(self.call(SocketCommand::Send, payload)?)?;
        Ok(response.task)
    }

    fn get_task(&self, task_id: &str) -> Result<Task> {
        let payload = serde_json::to_value(TaskIdPayload {
            id: task_id.to_string(),
        })?;
        let response: TaskResponse =
            serde_json::from_value(self.call(SocketCommand::GetTask, payload)?)?;
        Ok(response.task)
    }
}

/// JSON over HTTP to the agent's network endpoint
pub struct HttpTransport {
    base_url: String,
    timeout: Duration,
    client: ureq::Agent,
}

impl HttpTransport {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            base_url,
            timeout,
            client: Self::client(timeout, timeout),
        }
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.client = Self::client(self.timeout, response_timeout);
        self
    }

    fn client(timeout: Duration, response_timeout: Duration) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_write(timeout)
            .timeout_read(response_timeout)
            .build()
    }

    /// Ask the agent behind this endpoint to send on its own behalf
    pub fn relay(&self, request: &RelaySendRequest) -> Result<RelaySendResponse> {
        let url = format!("{}/send", self.base_url);
        let body = serde_json::to_value(request)?;
        Self::decode(self.client.post(&url).send_json(body))
    }

    fn decode<T: DeserializeOwned>(result: std::result::Result<ureq::Response, ureq::Error>) -> Result<T> {
        match result {
            Ok(response) => response
                .into_json()
                .map_err(|e| ParleyError::Serialization(e.to_string())),
            Err(ureq::Error::Status(status, response)) => {
                let text = response.into_string().unwrap_or_else(|_| "Unknown error".to_string());
                match serde_json::from_str::<WireError>(&text) {
                    Ok(wire) => Err(wire.into_error()),
                    Err(_) => Err(ParleyError::Remote {
                        status,
                        message: text,
                    }),
                }
            }
            // an I/O failure may come after the body went out
            Err(ureq::Error::Transport(transport)) if transport.kind() == ureq::ErrorKind::Io => {
                Err(ParleyError::response_lost("http", transport))
            }
            Err(ureq::Error::Transport(transport)) => Err(ParleyError::transport("http", transport)),
        }
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send_task(&self, request: &SendTaskRequest, priority: u8) -> Result<Task> {
        let url = if priority == DEFAULT_PRIORITY {
            format!("{}/tasks/send", self.base_url)
        } else {
            format!("{}/tasks/send-priority?priority={}", self.base_url, priority)
        };
        let body = serde_json::to_value(request)?;
        let response: TaskResponse = Self::decode(self.client.post(&url).send_json(body))?;
        Ok(response.task)
    }

    fn get_task(&self, task_id: &str) -> Result<Task> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let response: TaskResponse = Self::decode(self.client.get(&url).call())?;
        Ok(response.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_socket_preferred_only_when_present() {
        let dir = tempfile::TempDir::new().unwrap();
        let connector = DefaultConnector::new(Duration::from_millis(200));
        let mut record = AgentRecord::new("codex", 8120, 1, PathBuf::from("/work"));

        record.local_socket_path = Some(dir.path().join("codex.sock"));
        let names: Vec<_> = connector
            .transports(&Endpoint::from(&record))
            .iter()
            .map(|t| t.name())
            .collect();
        assert_eq!(names, vec!["http"]);

        std::fs::write(dir.path().join("codex.sock"), b"").unwrap();
        let names: Vec<_> = connector
            .transports(&Endpoint::from(&record))
            .iter()
            .map(|t| t.name())
            .collect();
        #[cfg(unix)]
        assert_eq!(names, vec!["socket", "http"]);
        #[cfg(not(unix))]
        assert_eq!(names, vec!["http"]);
    }

    #[test]
    fn test_http_unreachable_is_transport_error() {
        // port 9 (discard) is closed on any sane test host
        let transport = HttpTransport::new("http://127.0.0.1:9".to_string(), Duration::from_millis(300));
        let err = transport.get_task("x").unwrap_err();
        assert!(err.is_transport(), "got {:?}", err);
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_round_trip_against_line_server() {
        use crate::tasks::{Message, TaskDirection, TaskMetadata};
        use std::os::unix::net::UnixListener;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: SocketRequest = serde_json::from_str(&line).unwrap();
            assert_eq!(request.command, SocketCommand::Send);

            let task = Task::new(Message::user_text("ping"), TaskMetadata::default(), TaskDirection::Inbound);
            let response = SocketResponse::success(
                request.request_id,
                serde_json::to_value(TaskResponse { task }).unwrap(),
            );
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            let mut stream = stream;
            stream.write_all(out.as_bytes()).unwrap();
        });

        let transport = SocketTransport::new(path, Duration::from_secs(2));
        let request = SendTaskRequest {
            message: Message::user_text("ping"),
            metadata: TaskMetadata::default(),
            context_id: None,
        };
        let task = transport.send_task(&request, DEFAULT_PRIORITY).unwrap();
        assert_eq!(task.message.text(), "ping");
        server.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_stalled_answer_is_not_retryable() {
        use crate::tasks::{Message, TaskMetadata};
        use std::os::unix::net::UnixListener;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slow.sock");
        let listener = UnixListener::bind(&path).unwrap();

        // accepts and reads the request, then never answers
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            std::thread::sleep(Duration::from_millis(600));
            line
        });

        let transport = SocketTransport::new(path, Duration::from_secs(2))
            .with_response_timeout(Duration::from_millis(200));
        let request = SendTaskRequest {
            message: Message::user_text("ping"),
            metadata: TaskMetadata::default(),
            context_id: None,
        };
        let err = transport.send_task(&request, DEFAULT_PRIORITY).unwrap_err();
        assert!(matches!(err, ParleyError::ResponseLost { .. }), "got {:?}", err);
        assert!(!err.is_transport());
        assert!(server.join().unwrap().contains("ping"));
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_missing_is_transport_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let transport = SocketTransport::new(dir.path().join("gone.sock"), Duration::from_millis(200));
        assert!(transport.get_task("x").unwrap_err().is_transport());
    }
}
