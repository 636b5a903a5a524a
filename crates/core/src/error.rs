use thiserror::Error;
use uuid::Uuid;

use crate::event::ErrorKind;

/// Errors surfaced synchronously by the core components.
///
/// Agent-level failures never travel as `ChorusError` across the bus; they are
/// published as `error` events. The variants mirroring [`ErrorKind`] exist so
/// callers that need a typed value (logging, REST mapping) can build one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChorusError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("agent '{agent}' exceeded its deadline of {deadline_ms} ms")]
    AgentTimeout { agent: String, deadline_ms: u64 },

    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("{0}")]
    AgentFailure(String),

    #[error("protocol violation by agent '{agent}': {detail}")]
    ProtocolViolation { agent: String, detail: String },

    #[error("audio gap in task {task_id} at dispatch sequence {dispatch_sequence}")]
    SequencerGap {
        task_id: Uuid,
        dispatch_sequence: u64,
    },

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("agent '{0}' is registered more than once")]
    DuplicateAgent(String),
}

impl ChorusError {
    /// Final classification of an agent failure once retries are exhausted.
    pub fn from_agent(err: &AgentError, attempts: u32) -> Self {
        match err {
            AgentError::Transient(detail) => ChorusError::TransientUpstream(format!(
                "{detail} (gave up after {attempts} attempts)"
            )),
            AgentError::InvalidInput(_) | AgentError::Permanent(_) => {
                ChorusError::AgentFailure(err.to_string())
            }
        }
    }

    /// The wire-level error kind for variants that can appear inside an
    /// `error` event.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ChorusError::InvalidEvent(_) => Some(ErrorKind::InvalidEvent),
            ChorusError::AgentTimeout { .. } => Some(ErrorKind::AgentTimeout),
            ChorusError::TransientUpstream(_) => Some(ErrorKind::TransientUpstream),
            ChorusError::AgentFailure(_) => Some(ErrorKind::AgentFailure),
            ChorusError::ProtocolViolation { .. } => Some(ErrorKind::ProtocolViolation),
            ChorusError::SequencerGap { .. } => Some(ErrorKind::SequencerGap),
            ChorusError::TaskNotFound(_)
            | ChorusError::InvalidTask(_)
            | ChorusError::InvalidStateTransition { .. }
            | ChorusError::DuplicateAgent(_) => None,
        }
    }
}

pub type ChorusResult<T> = Result<T, ChorusError>;

/// Failure reported by an agent or by one of the collaborators it calls.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    /// Upstream hiccup (timeouts, rate limits, 5xx). Retried with backoff.
    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Permanent(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::InvalidInput(err.to_string())
    }
}
