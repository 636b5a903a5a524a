//! Chorus API Library Crate
//!
//! The network face of the engine: REST task control, the WebSocket and SSE
//! event push, and the speaker socket fed by the audio sequencer. The `api`
//! binary is a thin wrapper around this library.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod player;
pub mod router;
pub mod sse;
pub mod state;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chorus_core::agents::{AgentRegistry, CalendarAgent, GeneralAgent, WeatherAgent};
    use chorus_core::llm_client::{Inference, InferenceClient, InferenceRequest};
    use chorus_core::tools::demo_registry;
    use chorus_core::{
        AgentError, AudioSequencer, CommandBus, Orchestrator, SequencerConfig, StreamGateway,
    };

    use crate::player::SpeakerSink;
    use crate::state::AppState;

    struct Offline;

    #[async_trait]
    impl InferenceClient for Offline {
        async fn infer(&self, _request: InferenceRequest) -> Result<Inference, AgentError> {
            Err(AgentError::Permanent("no model in tests".into()))
        }
    }

    /// Demo agents on a fresh bus, speech muted. Must run inside a runtime.
    pub fn test_state() -> Arc<AppState> {
        let tools = Arc::new(demo_registry());
        let agents = AgentRegistry::builder(Arc::new(GeneralAgent::new(
            Arc::new(Offline),
            tools.clone(),
        )))
        .specialist(Arc::new(WeatherAgent::new(tools.clone())))
        .specialist(Arc::new(CalendarAgent::new(tools)))
        .build()
        .unwrap();

        let bus = Arc::new(CommandBus::default());
        let orchestrator = Orchestrator::builder(bus.clone(), Arc::new(agents)).build();
        let speaker = Arc::new(SpeakerSink::new(24_000));
        let sequencer =
            AudioSequencer::new(bus, speaker.clone(), SequencerConfig::default()).spawn();

        Arc::new(AppState {
            gateway: StreamGateway::new(orchestrator),
            speaker,
            sequencer: Arc::new(sequencer),
        })
    }
}
