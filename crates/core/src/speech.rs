//! Speech-synthesis collaborator: text in, a stream of PCM chunks out.

use std::pin::Pin;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateSpeechRequestArgs, SpeechModel, SpeechResponseFormat, Voice},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, stream};
use tracing::debug;

use crate::error::AgentError;
use crate::event::AudioEncoding;

/// OpenAI returns raw PCM at this rate when asked for `pcm`.
pub const OPENAI_PCM_SAMPLE_RATE: u32 = 24_000;

/// One buffer of synthesized audio.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    pub samples: Bytes,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
}

pub type SpeechStream = Pin<Box<dyn Stream<Item = Result<PcmChunk, AgentError>> + Send>>;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SpeechStream, AgentError>;
}

/// Produces no audio. Used when speech is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutedSynthesizer;

#[async_trait]
impl SpeechSynthesizer for MutedSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<SpeechStream, AgentError> {
        Ok(Box::pin(stream::empty()))
    }
}

/// Text-to-speech through the OpenAI audio endpoint.
pub struct OpenAISpeechSynthesizer {
    client: Client<OpenAIConfig>,
    model: String,
    voice: Voice,
    chunk_bytes: usize,
}

impl OpenAISpeechSynthesizer {
    /// Emitted chunks hold at most half a second of 24 kHz audio.
    pub fn new(config: OpenAIConfig, model: String, voice: &str) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            voice: parse_voice(voice),
            chunk_bytes: 24_000,
        }
    }
}

fn parse_voice(voice: &str) -> Voice {
    match voice.to_ascii_lowercase().as_str() {
        "echo" => Voice::Echo,
        "fable" => Voice::Fable,
        "onyx" => Voice::Onyx,
        "nova" => Voice::Nova,
        "shimmer" => Voice::Shimmer,
        _ => Voice::Alloy,
    }
}

fn speech_model(model: &str) -> SpeechModel {
    match model {
        "tts-1" => SpeechModel::Tts1,
        "tts-1-hd" => SpeechModel::Tts1Hd,
        other => SpeechModel::Other(other.to_string()),
    }
}

/// Splits a PCM16 buffer into chunks of at most `max_bytes`, keeping every
/// chunk a whole number of samples.
pub fn chunk_pcm(samples: Bytes, max_bytes: usize) -> Vec<Bytes> {
    let step = (max_bytes.max(2) / 2) * 2;
    let usable = samples.len() - samples.len() % 2;
    (0..usable)
        .step_by(step)
        .map(|start| samples.slice(start..(start + step).min(usable)))
        .collect()
}

#[async_trait]
impl SpeechSynthesizer for OpenAISpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SpeechStream, AgentError> {
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .model(speech_model(&self.model))
            .voice(self.voice.clone())
            .response_format(SpeechResponseFormat::Pcm)
            .build()?;

        let response = self.client.audio().speech(request).await?;
        debug!(bytes = response.bytes.len(), "Speech synthesized");

        let chunks = chunk_pcm(response.bytes, self.chunk_bytes)
            .into_iter()
            .map(|samples| {
                Ok(PcmChunk {
                    samples,
                    sample_rate: OPENAI_PCM_SAMPLE_RATE,
                    encoding: AudioEncoding::PcmS16le,
                })
            })
            .collect::<Vec<_>>();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Splits text after `.`, `!` or `?` when followed by whitespace. Empty
/// pieces are dropped.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().is_none_or(|next| next.is_whitespace());
        if at_boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}
