//! Local socket listener
//!
//! One JSON request per line, one JSON response per line, on a Unix socket
//! under the state directory. Same-host peers prefer it over HTTP.

use parley_core::protocol::{
    ConsumeReplyRequest, RelaySendRequest, SocketCommand, SocketRequest, SocketResponse,
    SocketSendPayload, TaskIdPayload, TaskListResponse, TaskResponse, DEFAULT_PRIORITY,
};
use parley_core::{AgentService, ParleyError};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Bind `path`, replacing a socket file left behind by a dead process
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Accept connections until the task is dropped
pub async fn serve(listener: UnixListener, service: Arc<AgentService>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, service).await {
                        tracing::debug!(error = %e, "socket connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "socket accept failed");
                return;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<AgentService>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<SocketRequest>(&line) {
            Ok(request) => {
                let service = service.clone();
                let request_id = request.request_id.clone();
                match tokio::task::spawn_blocking(move || dispatch(&service, request)).await {
                    Ok(response) => response,
                    Err(e) => SocketResponse::failure(
                        request_id,
                        &ParleyError::channel(format!("handler panicked: {}", e)),
                    ),
                }
            }
            Err(e) => SocketResponse::failure(String::new(), &ParleyError::from(e)),
        };

        let mut out = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Run one socket command against the service
pub fn dispatch(service: &AgentService, request: SocketRequest) -> SocketResponse {
    let SocketRequest {
        request_id,
        command,
        payload,
    } = request;
    tracing::debug!(%request_id, ?command, "socket request");

    match run(service, command, payload) {
        Ok(value) => SocketResponse::success(request_id, value),
        Err(e) => SocketResponse::failure(request_id, &e),
    }
}

fn run(
    service: &AgentService,
    command: SocketCommand,
    payload: serde_json::Value,
) -> parley_core::Result<serde_json::Value> {
    let value = match command {
        SocketCommand::Send => {
            let send: SocketSendPayload = decode(payload)?;
            let task = service.accept(send.request, send.priority.unwrap_or(DEFAULT_PRIORITY))?;
            serde_json::to_value(TaskResponse { task })?
        }
        SocketCommand::GetTask => {
            let TaskIdPayload { id } = decode(payload)?;
            serde_json::to_value(TaskResponse {
                task: service.get_task(&id)?,
            })?
        }
        SocketCommand::ListTasks => serde_json::to_value(TaskListResponse {
            tasks: service.list_tasks(),
        })?,
        SocketCommand::CancelTask => {
            let TaskIdPayload { id } = decode(payload)?;
            serde_json::to_value(TaskResponse {
                task: service.cancel_task(&id)?,
            })?
        }
        SocketCommand::Status => serde_json::to_value(service.status())?,
        SocketCommand::AgentCard => serde_json::to_value(service.agent_card())?,
        SocketCommand::ReplyTargets => serde_json::to_value(service.reply_targets()?)?,
        SocketCommand::ConsumeReplyTarget => {
            let request: ConsumeReplyRequest = if payload.is_null() {
                ConsumeReplyRequest::default()
            } else {
                decode(payload)?
            };
            serde_json::to_value(service.consume_reply_target(request.sender.as_deref())?)?
        }
        SocketCommand::Relay => {
            let request: RelaySendRequest = decode(payload)?;
            serde_json::to_value(service.relay(request)?)?
        }
    };
    Ok(value)
}

fn decode<T: DeserializeOwned>(payload: serde_json::Value) -> parley_core::Result<T> {
    Ok(serde_json::from_value(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::router::{Endpoint, SocketTransport, Transport};
    use parley_core::tasks::{Message, TaskMetadata, TaskState};
    use parley_core::{
        AgentDirectory, AgentRecord, Connector, ParleyConfig, ProgramProfile, SendTaskRequest,
        Session, SessionStatus, TaskStore,
    };
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct QuietSession;

    impl Session for QuietSession {
        fn write(&self, _data: &[u8]) -> parley_core::Result<()> {
            Ok(())
        }

        fn interrupt(&self) -> parley_core::Result<()> {
            Ok(())
        }

        fn interrupt_then_write(&self, _data: &[u8]) -> parley_core::Result<()> {
            Ok(())
        }

        fn status(&self) -> SessionStatus {
            SessionStatus::Processing
        }

        fn recent_output(&self, _n: usize) -> Vec<u8> {
            Vec::new()
        }

        fn output_offset(&self) -> u64 {
            0
        }

        fn output_since(&self, _offset: u64) -> Vec<u8> {
            Vec::new()
        }
    }

    struct NoPeers;

    impl Connector for NoPeers {
        fn transports(&self, _endpoint: &Endpoint) -> Vec<Box<dyn Transport>> {
            Vec::new()
        }
    }

    fn service(home: &TempDir) -> Arc<AgentService> {
        let config = ParleyConfig {
            home: Some(home.path().to_path_buf()),
            ..ParleyConfig::default()
        };
        let record = AgentRecord::new("gemini", 8130, std::process::id(), PathBuf::from("/work"));
        AgentDirectory::new(config.agents_dir()).register(&record).unwrap();
        Arc::new(
            AgentService::new(
                record,
                ProgramProfile::for_command("gemini"),
                Arc::new(QuietSession),
                Arc::new(TaskStore::new()),
                &config,
                Arc::new(NoPeers),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_dispatch_unknown_task() {
        let home = TempDir::new().unwrap();
        let service = service(&home);
        let response = dispatch(
            &service,
            SocketRequest {
                request_id: "r1".into(),
                command: SocketCommand::GetTask,
                payload: serde_json::json!({ "id": "missing" }),
            },
        );
        assert!(!response.ok);
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.error.unwrap().code, "task_not_found");
    }

    #[test]
    fn test_dispatch_bad_payload() {
        let home = TempDir::new().unwrap();
        let service = service(&home);
        let response = dispatch(
            &service,
            SocketRequest {
                request_id: "r2".into(),
                command: SocketCommand::CancelTask,
                payload: serde_json::json!({ "task": 1 }),
            },
        );
        assert_eq!(response.error.unwrap().code, "serialization");
    }

    #[test]
    fn test_dispatch_consume_without_payload() {
        let home = TempDir::new().unwrap();
        let service = service(&home);
        let response = dispatch(
            &service,
            SocketRequest {
                request_id: "r3".into(),
                command: SocketCommand::ConsumeReplyTarget,
                payload: serde_json::Value::Null,
            },
        );
        assert_eq!(response.error.unwrap().code, "no_reply_target");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_socket_transport_against_listener() {
        let home = TempDir::new().unwrap();
        let service = service(&home);
        let path = home.path().join("sockets").join("gemini.sock");
        let listener = bind(&path).unwrap();
        let server = tokio::spawn(serve(listener, service.clone()));

        let client_path = path.clone();
        let (sent, fetched) = tokio::task::spawn_blocking(move || {
            let transport = SocketTransport::new(client_path, Duration::from_secs(2));
            let request = SendTaskRequest {
                message: Message::user_text("hello"),
                metadata: TaskMetadata::default(),
                context_id: None,
            };
            let sent = transport.send_task(&request, DEFAULT_PRIORITY).unwrap();
            let fetched = transport.get_task(&sent.id).unwrap();
            (sent, fetched)
        })
        .await
        .unwrap();

        assert_eq!(sent.status, TaskState::Working);
        assert_eq!(fetched.id, sent.id);
        assert_eq!(service.list_tasks().len(), 1);
        server.abort();
    }
}
