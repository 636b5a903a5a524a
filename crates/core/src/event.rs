//! The event model: every observable fact in the system is an [`Event`]
//! published on the [`CommandBus`](crate::bus::CommandBus).

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChorusError, ChorusResult};
use crate::task::TaskOutcome;

/// Source identifier used for events emitted by the orchestrator and the
/// sequencer rather than by an agent.
pub const SYSTEM_SOURCE: &str = "system";

/// Discriminant of [`EventBody`], handy for filtering and for SSE event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStart,
    Status,
    Progress,
    Token,
    Speech,
    AgentStart,
    AgentDone,
    Error,
    TaskDone,
    TaskCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStart => "task_start",
            EventKind::Status => "status",
            EventKind::Progress => "progress",
            EventKind::Token => "token",
            EventKind::Speech => "speech",
            EventKind::AgentStart => "agent_start",
            EventKind::AgentDone => "agent_done",
            EventKind::Error => "error",
            EventKind::TaskDone => "task_done",
            EventKind::TaskCancelled => "task_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level classification carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidEvent,
    AgentTimeout,
    TransientUpstream,
    AgentFailure,
    ProtocolViolation,
    SequencerGap,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian mono PCM.
    PcmS16le,
}

impl AudioEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::PcmS16le => 2,
        }
    }
}

/// Payload of a `speech` event: one chunk of synthesized audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechPayload {
    pub task_id: Uuid,
    pub agent: String,
    /// Sequence of the `agent_start` event of the invocation that produced
    /// this audio. Orders audio by dispatch rather than by completion.
    pub dispatch_sequence: u64,
    /// The sentence this chunk belongs to.
    pub text: String,
    #[serde(with = "base64_bytes")]
    pub samples: Bytes,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    TaskStart {
        task_id: Uuid,
        text: String,
    },
    Status {
        task_id: Option<Uuid>,
        message: String,
    },
    Progress {
        task_id: Option<Uuid>,
        message: String,
        percentage: Option<f32>,
    },
    Token {
        task_id: Option<Uuid>,
        token: String,
    },
    Speech(SpeechPayload),
    AgentStart {
        task_id: Uuid,
        agent: String,
        invocation_id: Uuid,
    },
    AgentDone {
        task_id: Uuid,
        agent: String,
        invocation_id: Uuid,
        summary: String,
        result: serde_json::Value,
    },
    Error {
        task_id: Option<Uuid>,
        agent: Option<String>,
        invocation_id: Option<Uuid>,
        kind: ErrorKind,
        message: String,
    },
    TaskDone {
        task_id: Uuid,
        outcome: TaskOutcome,
    },
    TaskCancelled {
        task_id: Uuid,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::TaskStart { .. } => EventKind::TaskStart,
            EventBody::Status { .. } => EventKind::Status,
            EventBody::Progress { .. } => EventKind::Progress,
            EventBody::Token { .. } => EventKind::Token,
            EventBody::Speech(_) => EventKind::Speech,
            EventBody::AgentStart { .. } => EventKind::AgentStart,
            EventBody::AgentDone { .. } => EventKind::AgentDone,
            EventBody::Error { .. } => EventKind::Error,
            EventBody::TaskDone { .. } => EventKind::TaskDone,
            EventBody::TaskCancelled { .. } => EventKind::TaskCancelled,
        }
    }

    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            EventBody::TaskStart { task_id, .. }
            | EventBody::AgentStart { task_id, .. }
            | EventBody::AgentDone { task_id, .. }
            | EventBody::TaskDone { task_id, .. }
            | EventBody::TaskCancelled { task_id } => Some(*task_id),
            EventBody::Speech(payload) => Some(payload.task_id),
            EventBody::Status { task_id, .. }
            | EventBody::Progress { task_id, .. }
            | EventBody::Token { task_id, .. }
            | EventBody::Error { task_id, .. } => *task_id,
        }
    }

    /// Checks a body before the bus assigns it `sequence`.
    pub(crate) fn validate(&self, sequence: u64) -> ChorusResult<()> {
        let invalid = |reason: &str| Err(ChorusError::InvalidEvent(reason.to_string()));
        match self {
            EventBody::Status { message, .. } if message.trim().is_empty() => {
                invalid("status message is empty")
            }
            EventBody::Progress { percentage, .. } => match percentage {
                Some(p) if !p.is_finite() || !(0.0..=100.0).contains(p) => {
                    invalid("progress percentage must be within 0..=100")
                }
                _ => Ok(()),
            },
            EventBody::Token { token, .. } if token.is_empty() => invalid("token is empty"),
            EventBody::Speech(payload) => {
                if payload.sample_rate == 0 {
                    return invalid("speech sample rate is zero");
                }
                if payload.samples.is_empty() {
                    return invalid("speech carries no samples");
                }
                if payload.samples.len() % payload.encoding.bytes_per_sample() != 0 {
                    return invalid("speech buffer is not a whole number of samples");
                }
                if payload.dispatch_sequence >= sequence {
                    return invalid("speech dispatch sequence must precede the event");
                }
                Ok(())
            }
            EventBody::AgentStart { agent, .. } | EventBody::AgentDone { agent, .. }
                if agent.is_empty() =>
            {
                invalid("agent name is empty")
            }
            _ => Ok(()),
        }
    }
}

/// An immutable, sequenced record. Only the bus constructs these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn task_id(&self) -> Option<Uuid> {
        self.body.task_id()
    }

    /// JSON encoding relayed to external observers:
    /// `{type, source, sequence, timestamp, data}`.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
