//! Parley Server Library
//!
//! The request-handling surface of one agent: JSON over HTTP and
//! newline-delimited JSON over a local Unix socket, both dispatching to the
//! same `AgentService`.

pub mod routes;
pub mod socket;
pub mod state;

use axum::{
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use state::AppState;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing subscriber (only once)
///
/// `RUST_LOG` wins over `level`. With `log_file` set the
/// output goes there instead of stderr, which the wrapper needs because it
/// owns the terminal.
pub fn init_tracing(level: &str, log_file: Option<&Path>) {
    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| format!("{level},tower_http=info"));

        let (file_layer, stderr_layer) = match file {
            Some(file) => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                ),
                None,
            ),
            None => (
                None,
                Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            ),
        };

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(filter))
            .with(file_layer)
            .with(stderr_layer)
            .init();
    });
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Tasks
        .route("/tasks", get(routes::list_tasks))
        .route("/tasks/send", post(routes::send_task))
        .route("/tasks/send-priority", post(routes::send_task_priority))
        .route("/tasks/:id", get(routes::get_task))
        .route("/tasks/:id/cancel", post(routes::cancel_task))
        // Agent
        .route("/status", get(routes::status))
        .route("/.well-known/agent.json", get(routes::agent_card))
        // Reply correlation
        .route("/reply-targets", get(routes::reply_targets))
        .route("/reply-targets/consume", post(routes::consume_reply_target))
        // Outbound on this agent's behalf
        .route("/send", post(routes::relay_send))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve HTTP on `listener`, plus the local socket when `socket_path` is set,
/// until `shutdown` resolves
pub async fn run_server(
    state: AppState,
    listener: tokio::net::TcpListener,
    socket_path: Option<PathBuf>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let agent_id = state.service.agent_id().to_string();

    let socket_task = match socket_path {
        Some(path) => {
            let unix = socket::bind(&path)?;
            tracing::info!(agent_id = %agent_id, path = %path.display(), "listening on local socket");
            let service = state.service.clone();
            Some((path, tokio::spawn(socket::serve(unix, service))))
        }
        None => None,
    };

    let app = build_router(state);
    tracing::info!(agent_id = %agent_id, "listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    if let Some((path, task)) = socket_task {
        task.abort();
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(error = %e, "socket file already gone");
        }
    }
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": parley_core::version()
    }))
}
