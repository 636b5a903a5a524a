//! REST request/response bodies and their OpenAPI schemas.

use chorus_core::agents::{AgentDescriptor, AgentStatus};
use chorus_core::task::StepOutcome;
use chorus_core::{Context, Task, TaskOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Deserialize, ToSchema, Debug)]
pub struct SubmitTaskPayload {
    #[schema(example = "What's the weather in Tokyo and what's on my calendar today?")]
    pub text: String,
    /// Free-form key/value context handed to every agent, e.g. `{"location": "Paris"}`.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub context: Option<Context>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
pub struct TaskAccepted {
    pub task_id: Uuid,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
pub struct CancelResponse {
    pub task_id: Uuid,
    /// False when the task had already finished or was already cancelled.
    pub cancelled: bool,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ReportView {
    pub agent: String,
    pub text: String,
    #[schema(example = "succeeded")]
    pub status: String,
    /// Summary on success, failure reason otherwise.
    pub detail: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct OutcomeView {
    pub final_response: String,
    pub reports: Vec<ReportView>,
}

impl From<TaskOutcome> for OutcomeView {
    fn from(outcome: TaskOutcome) -> Self {
        let reports = outcome
            .reports
            .into_iter()
            .map(|r| {
                let (status, detail) = match r.outcome {
                    StepOutcome::Succeeded { summary, .. } => ("succeeded", summary),
                    StepOutcome::Failed { reason, .. } => ("failed", reason),
                };
                ReportView {
                    agent: r.agent,
                    text: r.text,
                    status: status.to_string(),
                    detail,
                }
            })
            .collect();
        Self {
            final_response: outcome.final_response,
            reports,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct TaskView {
    pub id: Uuid,
    pub text: String,
    #[schema(value_type = Object)]
    pub context: Context,
    #[schema(example = "parallel")]
    pub topology: String,
    #[schema(example = "running")]
    pub state: String,
    pub assigned_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<OutcomeView>,
}

impl TaskView {
    pub fn new(task: Task, outcome: Option<TaskOutcome>) -> Self {
        Self {
            id: task.id,
            text: task.text,
            context: task.context,
            topology: task.topology.to_string(),
            state: task.state.to_string(),
            assigned_agents: task.assigned_agents,
            created_at: task.created_at,
            finished_at: task.finished_at,
            outcome: outcome.map(OutcomeView::from),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct AgentView {
    pub name: String,
    pub capability_description: String,
    #[schema(example = "idle")]
    pub status: String,
    pub current_task_id: Option<Uuid>,
}

impl From<AgentDescriptor> for AgentView {
    fn from(d: AgentDescriptor) -> Self {
        let status = match d.status {
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Done => "done",
            AgentStatus::Error => "error",
        };
        Self {
            name: d.name,
            capability_description: d.capability_description,
            status: status.to_string(),
            current_task_id: d.current_task_id,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub latest_sequence: u64,
    pub events_published: u64,
    pub live_subscribers: usize,
    pub segments_played: u64,
    pub audio_gaps: u64,
    pub speaker_clients: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
