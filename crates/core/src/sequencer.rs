//! Serializes concurrently produced speech into one non-overlapping playback
//! stream.
//!
//! Within a task, audio is grouped into lanes, one per agent invocation, keyed
//! by the sequence of that invocation's `agent_start`. Lanes play in dispatch
//! order and segments within a lane in event order, so an agent dispatched
//! earlier is always heard first even if it finishes later. A lane stays open
//! until its invocation's terminal event, however many utterances it speaks;
//! one that holds up audio queued behind it for longer than the gap timeout is
//! skipped. Exactly one segment is handed to the [`AudioSink`] at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{CommandBus, DEFAULT_CHANNEL, Subscription};
use crate::error::ChorusError;
use crate::event::{AudioEncoding, Event, EventBody, SYSTEM_SOURCE, SpeechPayload};
use crate::task::TaskState;

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub channel: String,
    /// How long a silent lane may hold back audio queued behind it.
    pub gap_timeout: Duration,
    /// Upper bound on a single `AudioSink::play` call.
    pub ack_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            gap_timeout: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(30),
        }
    }
}

/// One playable chunk of speech, derived from a `speech` event.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub originating_task_id: Uuid,
    pub originating_agent: String,
    pub dispatch_sequence: u64,
    pub sequence: u64,
    pub text: String,
    pub samples: Bytes,
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    pub is_final: bool,
}

impl AudioSegment {
    fn from_payload(sequence: u64, payload: &SpeechPayload) -> Self {
        Self {
            originating_task_id: payload.task_id,
            originating_agent: payload.agent.clone(),
            dispatch_sequence: payload.dispatch_sequence,
            sequence,
            text: payload.text.clone(),
            samples: payload.samples.clone(),
            sample_rate: payload.sample_rate,
            encoding: payload.encoding,
            is_final: payload.is_final,
        }
    }

    pub fn from_event(event: &Event) -> Option<Self> {
        match &event.body {
            EventBody::Speech(payload) => Some(Self::from_payload(event.sequence, payload)),
            _ => None,
        }
    }

    /// Playback length at the segment's own sample rate.
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / self.encoding.bytes_per_sample();
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Consumer of ordered audio. `play` resolves when the consumer has finished
/// with the segment (acknowledgement or estimated duration).
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequencerStats {
    pub played: u64,
    pub discarded: u64,
    pub gaps: u64,
    pub playback_failures: u64,
}

#[derive(Debug, Default)]
struct Lane {
    agent: String,
    buffered: BTreeMap<u64, AudioSegment>,
    terminated: bool,
    skipped: bool,
    waiting_since: Option<Instant>,
}

impl Lane {
    fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            ..Default::default()
        }
    }

    fn complete(&self) -> bool {
        self.skipped || (self.terminated && self.buffered.is_empty())
    }
}

#[derive(Debug)]
struct TaskAudio {
    first_seen: u64,
    lanes: BTreeMap<u64, Lane>,
    done: bool,
}

impl TaskAudio {
    fn new(first_seen: u64) -> Self {
        Self {
            first_seen,
            lanes: BTreeMap::new(),
            done: false,
        }
    }

    fn drained(&self) -> bool {
        self.lanes.values().all(|l| l.complete() && l.buffered.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Notice {
    Gap {
        task_id: Uuid,
        agent: String,
        dispatch_sequence: u64,
        waited: Duration,
    },
    Skipped {
        task_id: Uuid,
        segments: u64,
        reason: &'static str,
    },
}

/// Ordering state, free of I/O so it can be driven step by step.
struct SequencerState {
    gap_timeout: Duration,
    tasks: HashMap<Uuid, TaskAudio>,
    invocations: HashMap<Uuid, (Uuid, u64)>,
    discarded_tasks: HashSet<Uuid>,
    playing: Option<(Uuid, u64)>,
    stats: SequencerStats,
}

impl SequencerState {
    fn new(gap_timeout: Duration) -> Self {
        Self {
            gap_timeout,
            tasks: HashMap::new(),
            invocations: HashMap::new(),
            discarded_tasks: HashSet::new(),
            playing: None,
            stats: SequencerStats::default(),
        }
    }

    fn ingest(&mut self, event: &Event) -> Vec<Notice> {
        let mut notices = Vec::new();
        match &event.body {
            EventBody::AgentStart {
                task_id,
                agent,
                invocation_id,
            } => {
                if !self.discarded_tasks.contains(task_id) {
                    self.tasks
                        .entry(*task_id)
                        .or_insert_with(|| TaskAudio::new(event.sequence))
                        .lanes
                        .entry(event.sequence)
                        .or_insert_with(|| Lane::new(agent));
                    self.invocations
                        .insert(*invocation_id, (*task_id, event.sequence));
                }
            }
            EventBody::Speech(payload) => self.ingest_speech(event.sequence, payload),
            EventBody::AgentDone { invocation_id, .. } => self.terminate_lane(invocation_id),
            EventBody::Error {
                invocation_id: Some(invocation_id),
                ..
            } => self.terminate_lane(invocation_id),
            EventBody::Error {
                invocation_id: None,
                ..
            } => {}
            EventBody::TaskDone { task_id, outcome } => {
                if outcome.state == TaskState::Failed {
                    notices.extend(self.discard_task(*task_id, "failed"));
                } else if let Some(task) = self.tasks.get_mut(task_id) {
                    task.done = true;
                    for lane in task.lanes.values_mut() {
                        lane.terminated = true;
                    }
                }
                // Nothing of this task can be published after task_done.
                self.discarded_tasks.remove(task_id);
            }
            EventBody::TaskCancelled { task_id } => {
                notices.extend(self.discard_task(*task_id, "cancelled"));
            }
            EventBody::TaskStart { .. }
            | EventBody::Status { .. }
            | EventBody::Progress { .. }
            | EventBody::Token { .. } => {}
        }
        notices
    }

    fn ingest_speech(&mut self, sequence: u64, payload: &SpeechPayload) {
        if self.discarded_tasks.contains(&payload.task_id) {
            self.stats.discarded += 1;
            return;
        }
        let lane = self
            .tasks
            .entry(payload.task_id)
            .or_insert_with(|| TaskAudio::new(payload.dispatch_sequence))
            .lanes
            .entry(payload.dispatch_sequence)
            .or_insert_with(|| Lane::new(&payload.agent));
        if lane.skipped {
            debug!(task_id = %payload.task_id, sequence, "Discarding late audio segment");
            self.stats.discarded += 1;
            return;
        }
        lane.buffered
            .insert(sequence, AudioSegment::from_payload(sequence, payload));
    }

    fn terminate_lane(&mut self, invocation_id: &Uuid) {
        let Some((task_id, lane_key)) = self.invocations.remove(invocation_id) else {
            return;
        };
        if let Some(lane) = self
            .tasks
            .get_mut(&task_id)
            .and_then(|t| t.lanes.get_mut(&lane_key))
        {
            lane.terminated = true;
        }
    }

    fn discard_task(&mut self, task_id: Uuid, reason: &'static str) -> Option<Notice> {
        self.discarded_tasks.insert(task_id);
        self.invocations.retain(|_, (t, _)| *t != task_id);
        let removed = self.tasks.remove(&task_id)?;
        let segments: u64 = removed
            .lanes
            .values()
            .map(|l| l.buffered.len() as u64)
            .sum();
        self.stats.discarded += segments;
        (segments > 0).then_some(Notice::Skipped {
            task_id,
            segments,
            reason,
        })
    }

    /// Updates gap timers and, when `take` is set, hands out the next
    /// segment to play.
    fn advance(&mut self, now: Instant, take: bool) -> (Option<AudioSegment>, Vec<Notice>) {
        let mut notices = Vec::new();
        let mut order: Vec<(u64, Uuid)> = self
            .tasks
            .iter()
            .map(|(id, t)| (t.first_seen, *id))
            .collect();
        order.sort_unstable();

        let mut next = None;
        for (_, task_id) in order {
            let want = take && next.is_none();
            if let Some(segment) = self.advance_task(task_id, now, want, &mut notices) {
                self.playing = Some((task_id, segment.dispatch_sequence));
                next = Some(segment);
            }
        }

        self.stats.gaps += notices
            .iter()
            .filter(|n| matches!(n, Notice::Gap { .. }))
            .count() as u64;
        self.tasks.retain(|_, t| !(t.done && t.drained()));
        (next, notices)
    }

    fn advance_task(
        &mut self,
        task_id: Uuid,
        now: Instant,
        take: bool,
        notices: &mut Vec<Notice>,
    ) -> Option<AudioSegment> {
        let playing = self.playing;
        let gap_timeout = self.gap_timeout;
        let task = self.tasks.get_mut(&task_id)?;
        let keys: Vec<u64> = task.lanes.keys().copied().collect();

        for (idx, key) in keys.iter().enumerate() {
            let blocking_audio = keys[idx + 1..].iter().any(|k| {
                let lane = &task.lanes[k];
                !lane.complete() && !lane.buffered.is_empty()
            });
            let lane = task.lanes.get_mut(key)?;
            if lane.complete() {
                continue;
            }
            if !lane.buffered.is_empty() {
                lane.waiting_since = None;
                if !take {
                    return None;
                }
                let (_, segment) = lane.buffered.pop_first()?;
                return Some(segment);
            }
            // Head lane is silent. Its own audio may still be playing.
            if !blocking_audio || playing == Some((task_id, *key)) {
                lane.waiting_since = None;
                return None;
            }
            let since = *lane.waiting_since.get_or_insert(now);
            let waited = now.saturating_duration_since(since);
            if waited < gap_timeout {
                return None;
            }
            lane.skipped = true;
            lane.waiting_since = None;
            notices.push(Notice::Gap {
                task_id,
                agent: lane.agent.clone(),
                dispatch_sequence: *key,
                waited,
            });
        }
        None
    }

    /// Earliest moment a waiting lane runs out of patience.
    fn next_deadline(&self) -> Option<Instant> {
        self.tasks
            .values()
            .flat_map(|t| t.lanes.values())
            .filter(|l| !l.complete())
            .filter_map(|l| l.waiting_since)
            .min()
            .map(|since| since + self.gap_timeout)
    }

    fn finish_playback(&mut self, ok: bool) {
        self.playing = None;
        if ok {
            self.stats.played += 1;
        } else {
            self.stats.playback_failures += 1;
        }
    }
}

struct Playback {
    segment: AudioSegment,
    result: Result<(), String>,
}

/// Running sequencer; dropping the handle leaves it running.
pub struct SequencerHandle {
    stats: Arc<Mutex<SequencerStats>>,
    join: JoinHandle<()>,
}

impl SequencerHandle {
    pub fn stats(&self) -> SequencerStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub struct AudioSequencer {
    bus: Arc<CommandBus>,
    sink: Arc<dyn AudioSink>,
    config: SequencerConfig,
    subscription: Subscription,
}

async fn wait_playback(playing: &mut Option<BoxFuture<'static, Playback>>) -> Playback {
    match playing {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl AudioSequencer {
    /// Subscribes immediately, so no audio published after this call is
    /// missed even if `spawn` happens later.
    pub fn new(bus: Arc<CommandBus>, sink: Arc<dyn AudioSink>, config: SequencerConfig) -> Self {
        let subscription = bus.subscribe_live(&config.channel);
        Self {
            bus,
            sink,
            config,
            subscription,
        }
    }

    pub fn spawn(self) -> SequencerHandle {
        let stats = Arc::new(Mutex::new(SequencerStats::default()));
        let shared = Arc::clone(&stats);
        let join = tokio::spawn(self.run(shared));
        SequencerHandle { stats, join }
    }

    fn start_playback(&self, segment: AudioSegment) -> BoxFuture<'static, Playback> {
        let sink = Arc::clone(&self.sink);
        let ack_timeout = self.config.ack_timeout;
        Box::pin(async move {
            let result = match tokio::time::timeout(ack_timeout, sink.play(&segment)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no acknowledgement within {ack_timeout:?}")),
            };
            Playback { segment, result }
        })
    }

    fn announce(&self, notices: Vec<Notice>) {
        for notice in notices {
            let (task_id, message) = match notice {
                Notice::Gap {
                    task_id,
                    agent,
                    dispatch_sequence,
                    waited,
                } => {
                    let err = ChorusError::SequencerGap {
                        task_id,
                        dispatch_sequence,
                    };
                    warn!(error = %err, %agent, ?waited, "Skipping silent audio lane");
                    (
                        task_id,
                        format!("audio gap: skipped {agent} after waiting {} ms", waited.as_millis()),
                    )
                }
                Notice::Skipped {
                    task_id,
                    segments,
                    reason,
                } => {
                    info!(%task_id, segments, reason, "Discarded pending audio");
                    (
                        task_id,
                        format!("skipped {segments} pending audio segment(s): task {reason}"),
                    )
                }
            };
            let body = EventBody::Status {
                task_id: Some(task_id),
                message,
            };
            if let Err(e) = self.bus.publish(&self.config.channel, SYSTEM_SOURCE, body) {
                warn!(error = %e, "Failed to publish sequencer status");
            }
        }
    }

    #[instrument(skip_all, name = "audio_sequencer")]
    async fn run(mut self, stats: Arc<Mutex<SequencerStats>>) {
        info!(gap_timeout = ?self.config.gap_timeout, "Audio sequencer started");
        let mut state = SequencerState::new(self.config.gap_timeout);
        let mut playing: Option<BoxFuture<'static, Playback>> = None;

        loop {
            let (next, notices) = state.advance(Instant::now(), playing.is_none());
            self.announce(notices);
            if let Some(segment) = next {
                debug!(
                    task_id = %segment.originating_task_id,
                    agent = %segment.originating_agent,
                    sequence = segment.sequence,
                    "Playing segment"
                );
                playing = Some(self.start_playback(segment));
            }
            *stats.lock().unwrap_or_else(PoisonError::into_inner) = state.stats;

            let deadline = state.next_deadline();
            tokio::select! {
                received = self.subscription.recv() => match received {
                    Some(event) => {
                        let notices = state.ingest(&event);
                        self.announce(notices);
                    }
                    None => break,
                },
                done = wait_playback(&mut playing) => {
                    playing = None;
                    match &done.result {
                        Err(e) => warn!(sequence = done.segment.sequence, error = %e, "Playback failed"),
                        Ok(()) if done.segment.is_final => debug!(
                            task_id = %done.segment.originating_task_id,
                            agent = %done.segment.originating_agent,
                            "Utterance played"
                        ),
                        Ok(()) => {}
                    }
                    state.finish_playback(done.result.is_ok());
                },
                _ = wait_until(deadline) => {}
            }
        }
        info!("Audio sequencer stopped");
    }
}
