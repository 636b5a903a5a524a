use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ChorusError, ChorusResult};
use crate::event::ErrorKind;

/// Conversation state handed to agents. Opaque to the bus.
pub type Context = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Single,
    Chain,
    Parallel,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topology::Single => "single",
            Topology::Chain => "chain",
            Topology::Parallel => "parallel",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Partial | TaskState::Failed
        )
    }

    fn can_transition_to(&self, next: TaskState) -> bool {
        match self {
            TaskState::Pending => matches!(next, TaskState::Running | TaskState::Failed),
            TaskState::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Aggregates per-agent outcomes: all succeeded, some succeeded, or none.
    pub fn from_reports(reports: &[AgentReport]) -> TaskState {
        let succeeded = reports.iter().filter(|r| r.succeeded()).count();
        match succeeded {
            0 => TaskState::Failed,
            n if n == reports.len() => TaskState::Succeeded,
            _ => TaskState::Partial,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Partial => "partial",
            TaskState::Failed => "failed",
        })
    }
}

/// One user-initiated request tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub text: String,
    pub context: Context,
    pub topology: Topology,
    pub state: TaskState,
    pub assigned_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(text: impl Into<String>, context: Context) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            context,
            topology: Topology::Single,
            state: TaskState::Pending,
            assigned_agents: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Moves the task along `pending -> running -> terminal`. Terminal states
    /// never change again.
    pub fn transition(&mut self, next: TaskState) -> ChorusResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ChorusError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { summary: String, result: Value },
    Failed { kind: ErrorKind, reason: String },
}

/// What one routed step produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent: String,
    pub text: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

impl AgentReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StepOutcome::Succeeded { .. })
    }

    pub fn failed(agent: &str, text: &str, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            text: text.to_string(),
            outcome: StepOutcome::Failed {
                kind,
                reason: reason.into(),
            },
        }
    }
}

/// Carried by `task_done`: the terminal state, every step's report and the
/// aggregated response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub topology: Topology,
    pub reports: Vec<AgentReport>,
    pub final_response: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(agent: &str) -> AgentReport {
        AgentReport {
            agent: agent.into(),
            text: "q".into(),
            outcome: StepOutcome::Succeeded {
                summary: "done".into(),
                result: json!({}),
            },
        }
    }

    fn failed(agent: &str) -> AgentReport {
        AgentReport::failed(agent, "q", ErrorKind::AgentFailure, "boom")
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut task = Task::new("hello", Context::new());
        assert_eq!(task.state, TaskState::Pending);
        task.transition(TaskState::Running).unwrap();
        task.transition(TaskState::Partial).unwrap();
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut task = Task::new("hello", Context::new());
        task.transition(TaskState::Running).unwrap();
        task.transition(TaskState::Succeeded).unwrap();

        let err = task.transition(TaskState::Failed).unwrap_err();
        assert_eq!(
            err,
            ChorusError::InvalidStateTransition {
                from: "succeeded".into(),
                to: "failed".into()
            }
        );
        assert_eq!(task.state, TaskState::Succeeded);
    }

    #[test]
    fn test_pending_cannot_skip_to_success() {
        let mut task = Task::new("hello", Context::new());
        assert!(task.transition(TaskState::Succeeded).is_err());
        assert!(task.transition(TaskState::Pending).is_err());
    }

    #[test]
    fn test_state_aggregation() {
        assert_eq!(
            TaskState::from_reports(&[ok("a"), ok("b")]),
            TaskState::Succeeded
        );
        assert_eq!(
            TaskState::from_reports(&[ok("a"), failed("b")]),
            TaskState::Partial
        );
        assert_eq!(
            TaskState::from_reports(&[failed("a"), failed("b")]),
            TaskState::Failed
        );
        assert_eq!(TaskState::from_reports(&[]), TaskState::Failed);
    }

    #[test]
    fn test_report_serialization_is_flat() {
        let value = serde_json::to_value(failed("weather")).unwrap();
        assert_eq!(
            value,
            json!({
                "agent": "weather",
                "text": "q",
                "status": "failed",
                "kind": "agent_failure",
                "reason": "boom"
            })
        );
    }
}
