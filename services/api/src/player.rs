//! Speaker output: the audio sink the sequencer plays into.

use async_trait::async_trait;
use bytes::Bytes;
use chorus_core::{AudioSegment, AudioSink};
use tokio::sync::broadcast;
use tracing::debug;

use crate::audio_utils::{decode_pcm16_le, encode_pcm16_le, playback_duration, resample};

const FRAME_BUFFER: usize = 64;

/// Fans ordered PCM16 frames out to connected speaker clients and paces
/// itself by the frames' playback duration, so a segment is "done" once a
/// listener would have finished hearing it.
pub struct SpeakerSink {
    frames: broadcast::Sender<Bytes>,
    sample_rate: u32,
}

impl SpeakerSink {
    pub fn new(sample_rate: u32) -> Self {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self {
            frames,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.frames.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.frames.receiver_count()
    }
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
        let samples = decode_pcm16_le(&segment.samples);
        let resampled = resample(&samples, segment.sample_rate, self.sample_rate)?;
        let duration = playback_duration(resampled.len(), self.sample_rate);

        match self.frames.send(encode_pcm16_le(&resampled)) {
            Ok(listeners) => debug!(
                sequence = segment.sequence,
                agent = %segment.originating_agent,
                listeners,
                ?duration,
                "Segment sent to speakers"
            ),
            // Nobody listening: still pace playback so ordering holds.
            Err(_) => debug!(sequence = segment.sequence, "No speaker connected"),
        }
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::event::AudioEncoding;
    use std::time::Duration;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn segment(frames: usize, sample_rate: u32) -> AudioSegment {
        AudioSegment {
            originating_task_id: Uuid::new_v4(),
            originating_agent: "weather".into(),
            dispatch_sequence: 3,
            sequence: 7,
            text: "Sunny.".into(),
            samples: encode_pcm16_le(&vec![0.5; frames]),
            sample_rate,
            encoding: AudioEncoding::PcmS16le,
            is_final: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_broadcasts_and_paces() {
        let sink = SpeakerSink::new(24_000);
        let mut speaker = sink.subscribe();
        assert_eq!(sink.listeners(), 1);

        let started = Instant::now();
        sink.play(&segment(12_000, 24_000)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));

        let frame = speaker.recv().await.unwrap();
        assert_eq!(frame.len(), 24_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_resamples_to_player_rate() {
        let sink = SpeakerSink::new(48_000);
        let mut speaker = sink.subscribe();
        sink.play(&segment(2_400, 24_000)).await.unwrap();
        assert_eq!(speaker.recv().await.unwrap().len(), 4_800 * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_without_listeners_still_succeeds() {
        let sink = SpeakerSink::new(24_000);
        assert!(sink.play(&segment(240, 24_000)).await.is_ok());
    }
}
