//! Core of the chorus multi-agent engine: the event bus, the orchestrator that
//! dispatches agents over it, the audio sequencer that serializes their speech
//! and the gateway that relays everything to observers.

pub mod agents;
pub mod bus;
pub mod error;
pub mod event;
pub mod gateway;
pub mod llm_client;
pub mod orchestrator;
pub mod routing;
pub mod sequencer;
pub mod speech;
pub mod task;
pub mod tools;

pub use bus::{BusConfig, BusStats, CommandBus, DEFAULT_CHANNEL, Subscription};
pub use error::{AgentError, ChorusError, ChorusResult};
pub use event::{ErrorKind, Event, EventBody, EventKind};
pub use gateway::{EventFeed, StreamGateway};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RetryPolicy};
pub use sequencer::{AudioSegment, AudioSequencer, AudioSink, SequencerConfig, SequencerHandle};
pub use task::{Context, Task, TaskOutcome, TaskState, Topology};
