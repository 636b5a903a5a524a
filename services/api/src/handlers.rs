//! Axum Handlers for the REST API
//!
//! The control side of the gateway: submit, inspect and cancel tasks. Progress
//! itself is only ever delivered on the push channels (`/ws`, `/events`).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chorus_core::ChorusError;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::{
    models::{AgentView, CancelResponse, ErrorResponse, HealthResponse, SubmitTaskPayload, TaskAccepted, TaskView},
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl From<ChorusError> for ApiError {
    fn from(err: ChorusError) -> Self {
        match err {
            ChorusError::InvalidTask(_) | ChorusError::InvalidEvent(_) => {
                Self::BadRequest(err.to_string())
            }
            ChorusError::TaskNotFound(_) => Self::NotFound(err.to_string()),
            other => Self::InternalServerError(other.into()),
        }
    }
}

/// Submit a task. Returns immediately with its id.
#[utoipa::path(
    post,
    path = "/tasks",
    request_body = SubmitTaskPayload,
    responses(
        (status = 202, description = "Task accepted", body = TaskAccepted),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitTaskPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = state
        .gateway
        .submit(payload.text, payload.context.unwrap_or_default())?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

/// List every known task, oldest first.
#[utoipa::path(
    get,
    path = "/tasks",
    responses(
        (status = 200, description = "Known tasks", body = [TaskView])
    )
)]
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskView>> {
    let orchestrator = state.gateway.orchestrator();
    let tasks = orchestrator
        .tasks()
        .into_iter()
        .map(|task| {
            let outcome = orchestrator.outcome(task.id);
            TaskView::new(task, outcome)
        })
        .collect();
    Json(tasks)
}

/// Get a task by its id.
#[utoipa::path(
    get,
    path = "/tasks/{id}",
    responses(
        (status = 200, description = "Task details", body = TaskView),
        (status = 404, description = "Task not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Task ID")
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, ApiError> {
    let orchestrator = state.gateway.orchestrator();
    let task = orchestrator
        .task(id)
        .ok_or_else(|| ApiError::NotFound(format!("Task with id '{}' not found", id)))?;
    Ok(Json(TaskView::new(task, orchestrator.outcome(id))))
}

/// Cancel a running task.
#[utoipa::path(
    post,
    path = "/tasks/{id}/cancel",
    responses(
        (status = 200, description = "Cancellation result", body = CancelResponse),
        (status = 404, description = "Task not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Task ID")
    )
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.gateway.cancel(id)?;
    Ok(Json(CancelResponse {
        task_id: id,
        cancelled,
    }))
}

/// List the registered agents and what they are doing.
#[utoipa::path(
    get,
    path = "/agents",
    responses(
        (status = 200, description = "Registered agents", body = [AgentView])
    )
)]
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentView>> {
    Json(
        state
            .gateway
            .orchestrator()
            .agents()
            .into_iter()
            .map(AgentView::from)
            .collect(),
    )
}

/// Liveness plus bus and audio counters.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let bus = state.gateway.orchestrator().bus().stats();
    let audio = state.sequencer.stats();
    let status = if state.sequencer.is_finished() {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status: status.to_string(),
        latest_sequence: state.gateway.latest_sequence(),
        events_published: bus.published,
        live_subscribers: bus.live_subscribers,
        segments_played: audio.played,
        audio_gaps: audio.gaps,
        speaker_clients: state.speaker.listeners(),
    })
}
