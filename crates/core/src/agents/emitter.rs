use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::AgentOutput;
use crate::bus::CommandBus;
use crate::error::{ChorusError, ChorusResult};
use crate::event::{ErrorKind, Event, EventBody, SpeechPayload};
use crate::speech::{PcmChunk, SpeechSynthesizer, split_into_sentences};

/// Ledger of one agent invocation.
///
/// The terminal flag is claimed with a single atomic swap, so whichever of the
/// runner, the watchdog or a cancellation gets there first publishes the one
/// terminal event; everyone else backs off. A sealed invocation has had its
/// results discarded and may not publish anything further.
#[derive(Debug)]
pub struct Invocation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent: String,
    dispatch_sequence: OnceLock<u64>,
    terminal: AtomicBool,
    sealed: AtomicBool,
}

impl Invocation {
    pub fn new(task_id: Uuid, agent: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            task_id,
            agent: agent.into(),
            dispatch_sequence: OnceLock::new(),
            terminal: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
        })
    }

    /// Sequence of this invocation's `agent_start`, once published.
    pub fn dispatch_sequence(&self) -> Option<u64> {
        self.dispatch_sequence.get().copied()
    }

    /// Returns true for exactly one caller.
    pub fn claim_terminal(&self) -> bool {
        !self.terminal.swap(true, Ordering::AcqRel)
    }

    pub fn has_terminated(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

/// Publishing handle given to an agent for one invocation. Only
/// non-terminal events can be sent through it.
#[derive(Clone)]
pub struct AgentEmitter {
    bus: Arc<CommandBus>,
    channel: Arc<str>,
    invocation: Arc<Invocation>,
    speech: Arc<dyn SpeechSynthesizer>,
}

impl AgentEmitter {
    pub fn new(
        bus: Arc<CommandBus>,
        channel: Arc<str>,
        invocation: Arc<Invocation>,
        speech: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            bus,
            channel,
            invocation,
            speech,
        }
    }

    pub fn invocation(&self) -> &Arc<Invocation> {
        &self.invocation
    }

    fn publish(&self, body: EventBody) -> Option<Arc<Event>> {
        if self.invocation.is_sealed() {
            debug!(agent = %self.invocation.agent, kind = %body.kind(), "Dropping output of sealed invocation");
            return None;
        }
        match self.bus.publish(&self.channel, self.invocation.agent.as_str(), body) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(agent = %self.invocation.agent, error = %e, "Agent event rejected");
                None
            }
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publish(EventBody::Status {
            task_id: Some(self.invocation.task_id),
            message: message.into(),
        });
    }

    pub fn progress(&self, message: impl Into<String>, percentage: Option<f32>) {
        self.publish(EventBody::Progress {
            task_id: Some(self.invocation.task_id),
            message: message.into(),
            percentage,
        });
    }

    pub fn token(&self, token: impl Into<String>) {
        self.publish(EventBody::Token {
            task_id: Some(self.invocation.task_id),
            token: token.into(),
        });
    }

    /// Synthesizes `text` sentence by sentence and publishes the audio as
    /// `speech` events anchored to this invocation's dispatch sequence. The
    /// last chunk of the last sentence is marked final. Synthesis failures are
    /// reported as a status event; speech is never fatal to the agent.
    ///
    /// Returns the number of speech events published.
    pub async fn speak(&self, text: &str) -> usize {
        let Some(anchor) = self.invocation.dispatch_sequence() else {
            warn!(agent = %self.invocation.agent, "speak() before dispatch; ignoring");
            return 0;
        };
        let sentences = split_into_sentences(text);
        let total = sentences.len();
        let mut published = 0;

        for (index, sentence) in sentences.iter().enumerate() {
            if self.invocation.is_sealed() {
                break;
            }
            let mut stream = match self.speech.synthesize(sentence).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(agent = %self.invocation.agent, error = %e, "Speech synthesis failed");
                    self.status(format!("speech unavailable: {e}"));
                    return published;
                }
            };

            // Hold one chunk back so the last one can be flagged.
            let mut pending: Option<PcmChunk> = None;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        if let Some(previous) = pending.replace(chunk) {
                            published += self.publish_speech(anchor, sentence, previous, false);
                        }
                    }
                    Err(e) => {
                        warn!(agent = %self.invocation.agent, error = %e, "Speech stream failed");
                        break;
                    }
                }
            }
            if let Some(last) = pending {
                published += self.publish_speech(anchor, sentence, last, index + 1 == total);
            }
        }
        published
    }

    fn publish_speech(&self, anchor: u64, sentence: &str, chunk: PcmChunk, is_final: bool) -> usize {
        let body = EventBody::Speech(SpeechPayload {
            task_id: self.invocation.task_id,
            agent: self.invocation.agent.clone(),
            dispatch_sequence: anchor,
            text: sentence.to_string(),
            samples: chunk.samples,
            sample_rate: chunk.sample_rate,
            encoding: chunk.encoding,
            is_final,
        });
        usize::from(self.publish(body).is_some())
    }

    /// Publishes `agent_start` and records its sequence as the dispatch
    /// anchor.
    pub(crate) fn start(&self) -> ChorusResult<u64> {
        let event = self.bus.publish(
            &self.channel,
            self.invocation.agent.as_str(),
            EventBody::AgentStart {
                task_id: self.invocation.task_id,
                agent: self.invocation.agent.clone(),
                invocation_id: self.invocation.id,
            },
        )?;
        let _ = self.invocation.dispatch_sequence.set(event.sequence);
        Ok(event.sequence)
    }

    /// Publishes the terminal event for `result` if nobody else has.
    pub(crate) fn finish(&self, result: &Result<AgentOutput, ChorusError>) -> bool {
        if !self.invocation.claim_terminal() {
            debug!(agent = %self.invocation.agent, "Terminal already claimed; discarding result");
            return false;
        }
        let body = match result {
            Ok(output) => EventBody::AgentDone {
                task_id: self.invocation.task_id,
                agent: self.invocation.agent.clone(),
                invocation_id: self.invocation.id,
                summary: output.summary.clone(),
                result: output.data.clone(),
            },
            Err(e) => EventBody::Error {
                task_id: Some(self.invocation.task_id),
                agent: Some(self.invocation.agent.clone()),
                invocation_id: Some(self.invocation.id),
                kind: e.kind().unwrap_or(ErrorKind::AgentFailure),
                message: e.to_string(),
            },
        };
        self.publish_terminal(body)
    }

    /// Publishes an orchestrator-decided error terminal and seals the
    /// invocation.
    pub(crate) fn force_error(&self, kind: ErrorKind, message: impl Into<String>) -> bool {
        let claimed = self.invocation.claim_terminal();
        self.invocation.seal();
        if !claimed {
            return false;
        }
        self.publish_terminal(EventBody::Error {
            task_id: Some(self.invocation.task_id),
            agent: Some(self.invocation.agent.clone()),
            invocation_id: Some(self.invocation.id),
            kind,
            message: message.into(),
        })
    }

    fn publish_terminal(&self, body: EventBody) -> bool {
        match self.bus.publish(&self.channel, self.invocation.agent.as_str(), body) {
            Ok(_) => true,
            Err(e) => {
                warn!(agent = %self.invocation.agent, error = %e, "Terminal event rejected");
                false
            }
        }
    }
}
