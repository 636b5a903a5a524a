//! In-process publish/subscribe broker.
//!
//! A single mutex guards the sequence counter, the per-channel ring buffers and
//! the subscriber lists, so assigning a sequence number, retaining the event and
//! handing it to every subscriber happen as one step. Subscriber queues are
//! unbounded: a slow subscriber only grows its own queue and never stalls the
//! publisher.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::error::{ChorusError, ChorusResult};
use crate::event::{Event, EventBody};

/// Channel every component uses unless configured otherwise.
pub const DEFAULT_CHANNEL: &str = "events";
pub const DEFAULT_RING_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events retained per channel for late joiners.
    pub ring_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub pruned_subscribers: u64,
    pub live_subscribers: usize,
}

type Sender = mpsc::UnboundedSender<Arc<Event>>;

#[derive(Default)]
struct Channel {
    ring: VecDeque<Arc<Event>>,
    subscribers: Vec<(SubscriberId, Sender)>,
}

struct Inner {
    next_sequence: u64,
    next_subscriber: u64,
    channels: HashMap<String, Channel>,
    stats: BusStats,
}

pub struct CommandBus {
    ring_capacity: usize,
    inner: Mutex<Inner>,
}

impl CommandBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            ring_capacity: config.ring_capacity.max(1),
            inner: Mutex::new(Inner {
                next_sequence: 1,
                next_subscriber: 1,
                channels: HashMap::new(),
                stats: BusStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing inside the critical section can leave `Inner` half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates, sequences, retains and delivers one event.
    ///
    /// A malformed body is rejected with [`ChorusError::InvalidEvent`] before
    /// a sequence number is consumed; nothing is delivered in that case.
    pub fn publish(
        &self,
        channel: &str,
        source: impl Into<String>,
        body: EventBody,
    ) -> ChorusResult<Arc<Event>> {
        let source = source.into();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let sequence = inner.next_sequence;
        let validation = if source.trim().is_empty() {
            Err(ChorusError::InvalidEvent("event source is empty".into()))
        } else {
            body.validate(sequence)
        };
        if let Err(err) = validation {
            inner.stats.rejected += 1;
            warn!(channel, kind = %body.kind(), error = %err, "Rejected event");
            return Err(err);
        }
        inner.next_sequence += 1;

        let event = Arc::new(Event {
            source,
            sequence,
            timestamp: Utc::now(),
            body,
        });

        let chan = inner.channels.entry(channel.to_string()).or_default();
        chan.ring.push_back(Arc::clone(&event));
        let mut evicted = 0;
        while chan.ring.len() > self.ring_capacity {
            chan.ring.pop_front();
            evicted += 1;
        }

        let before = chan.subscribers.len();
        chan.subscribers
            .retain(|(_, tx)| tx.send(Arc::clone(&event)).is_ok());
        let pruned = (before - chan.subscribers.len()) as u64;
        if pruned > 0 {
            debug!(channel, pruned, "Pruned closed subscribers");
        }

        inner.stats.published += 1;
        inner.stats.evicted += evicted;
        inner.stats.pruned_subscribers += pruned;
        Ok(event)
    }

    /// Registers a subscriber, replaying retained events first.
    ///
    /// With `from_sequence = Some(k)` the replay holds every retained event
    /// whose sequence is `>= k`. With `None` the whole retained tail is
    /// replayed.
    pub fn subscribe(&self, channel: &str, from_sequence: Option<u64>) -> Subscription {
        self.register(channel, Some(from_sequence.unwrap_or(0)))
    }

    /// Registers a subscriber that only sees events published from now on.
    pub fn subscribe_live(&self, channel: &str) -> Subscription {
        self.register(channel, None)
    }

    fn register(&self, channel: &str, replay_from: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let id = SubscriberId(inner.next_subscriber);
        inner.next_subscriber += 1;

        let chan = inner.channels.entry(channel.to_string()).or_default();
        if let Some(from) = replay_from {
            for event in chan.ring.iter().filter(|e| e.sequence >= from) {
                // The receiver is alive: we still hold it.
                let _ = tx.send(Arc::clone(event));
            }
        }
        chan.subscribers.push((id, tx));
        debug!(channel, subscriber = id.0, ?replay_from, "Subscriber registered");

        Subscription {
            id,
            channel: channel.to_string(),
            rx,
        }
    }

    /// Removes a subscriber. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut guard = self.lock();
        for chan in guard.channels.values_mut() {
            chan.subscribers.retain(|(sid, _)| *sid != id);
        }
    }

    /// Sequence of the most recently published event, 0 before the first.
    pub fn latest_sequence(&self) -> u64 {
        self.lock().next_sequence - 1
    }

    pub fn stats(&self) -> BusStats {
        let guard = self.lock();
        BusStats {
            live_subscribers: guard
                .channels
                .values()
                .map(|c| c.subscribers.iter().filter(|(_, tx)| !tx.is_closed()).count())
                .sum(),
            ..guard.stats
        }
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Read side of a subscription. Dropping it closes the queue; the bus prunes
/// the entry on its next publish.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    channel: String,
    rx: mpsc::UnboundedReceiver<Arc<Event>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> + Send + 'static {
        UnboundedReceiverStream::new(self.rx)
    }
}
