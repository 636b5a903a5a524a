//! Axum Router Configuration
//!
//! REST control endpoints, the two push channels (`/ws`, `/events`), the
//! speaker socket and the OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AgentView, CancelResponse, ErrorResponse, HealthResponse, OutcomeView, ReportView,
        SubmitTaskPayload, TaskAccepted, TaskView,
    },
    sse::events_handler,
    state::AppState,
    ws::{audio_ws_handler, ws_handler},
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::submit_task,
        handlers::list_tasks,
        handlers::get_task,
        handlers::cancel_task,
        handlers::list_agents,
        handlers::health,
    ),
    components(
        schemas(SubmitTaskPayload, TaskAccepted, CancelResponse, TaskView, OutcomeView, ReportView, AgentView, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "Chorus API", description = "Task control for the chorus multi-agent engine")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route(
            "/tasks",
            get(handlers::list_tasks).post(handlers::submit_task),
        )
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .route("/agents", get(handlers::list_agents))
        .route("/health", get(handlers::health))
        .route("/events", get(events_handler))
        .route("/ws", get(ws_handler))
        .route("/ws/audio", get(audio_ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
