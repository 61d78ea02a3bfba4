//! API route handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::protocol::{
    http_status, ConsumeReplyRequest, RelaySendRequest, RelaySendResponse, SendTaskRequest,
    TaskListResponse, TaskResponse, WireError, DEFAULT_PRIORITY,
};
use parley_core::ParleyError;
use serde::Deserialize;

use crate::state::AppState;

/// Error with the status code and `{code, error}` body the transports decode
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] ParleyError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(http_status(&self.0)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        (status, Json(WireError::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run blocking service work off the async workers
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> parley_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError),
        Err(e) => Err(ApiError(ParleyError::channel(format!("handler panicked: {}", e)))),
    }
}

// ========== Task Routes ==========

/// Accept a task at the default priority
pub async fn send_task(
    State(state): State<AppState>,
    Json(req): Json<SendTaskRequest>,
) -> ApiResult<TaskResponse> {
    accept(state, req, DEFAULT_PRIORITY).await
}

#[derive(Deserialize)]
pub struct PriorityQuery {
    #[serde(default = "default_priority")]
    priority: u8,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// Accept a task; priority 5 interrupts the session first
pub async fn send_task_priority(
    State(state): State<AppState>,
    Query(query): Query<PriorityQuery>,
    Json(req): Json<SendTaskRequest>,
) -> ApiResult<TaskResponse> {
    accept(state, req, query.priority).await
}

async fn accept(state: AppState, req: SendTaskRequest, priority: u8) -> ApiResult<TaskResponse> {
    let service = state.service.clone();
    let task = blocking(move || service.accept(req, priority)).await?;
    Ok(Json(TaskResponse { task }))
}

pub async fn list_tasks(State(state): State<AppState>) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        tasks: state.service.list_tasks(),
    })
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskResponse> {
    let task = state.service.get_task(&id)?;
    Ok(Json(TaskResponse { task }))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskResponse> {
    let task = state.service.cancel_task(&id)?;
    Ok(Json(TaskResponse { task }))
}

// ========== Agent Routes ==========

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.status())
}

/// Capability descriptor
pub async fn agent_card(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.agent_card())
}

// ========== Reply Routes ==========

pub async fn reply_targets(State(state): State<AppState>) -> impl IntoResponse {
    let service = state.service.clone();
    blocking(move || service.reply_targets()).await.map(Json)
}

/// Pop the target a generic reply should go to
pub async fn consume_reply_target(
    State(state): State<AppState>,
    body: Option<Json<ConsumeReplyRequest>>,
) -> impl IntoResponse {
    let sender = body.and_then(|Json(req)| req.sender);
    let service = state.service.clone();
    blocking(move || service.consume_reply_target(sender.as_deref()))
        .await
        .map(Json)
}

// ========== Outbound Routes ==========

/// Send from this agent, so a roundtrip's placeholder lands in its store
pub async fn relay_send(
    State(state): State<AppState>,
    Json(req): Json<RelaySendRequest>,
) -> ApiResult<RelaySendResponse> {
    let service = state.service.clone();
    blocking(move || service.relay(req)).await.map(Json)
}
