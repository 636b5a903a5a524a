//! Shared Application State
//!
//! Everything a handler needs, created once at startup.

use std::sync::Arc;

use chorus_core::{SequencerHandle, StreamGateway};

use crate::player::SpeakerSink;

#[derive(Clone)]
pub struct AppState {
    pub gateway: StreamGateway,
    pub speaker: Arc<SpeakerSink>,
    pub sequencer: Arc<SequencerHandle>,
}
