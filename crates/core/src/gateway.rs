//! Fan-out adapter between the bus and external observers.
//!
//! The gateway relays events verbatim and in bus order. It keeps no buffer of
//! its own; resuming a feed relies on the bus ring.

use std::sync::Arc;

use futures::Stream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{CommandBus, Subscription};
use crate::error::ChorusResult;
use crate::event::Event;
use crate::orchestrator::Orchestrator;
use crate::task::Context;

#[derive(Clone)]
pub struct StreamGateway {
    orchestrator: Arc<Orchestrator>,
}

impl StreamGateway {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn bus(&self) -> &Arc<CommandBus> {
        self.orchestrator.bus()
    }

    /// Opens a feed on the orchestrator's channel. `None` starts at "now";
    /// `Some(k)` first replays the retained events with sequence `>= k`.
    pub fn open(&self, resume_from: Option<u64>) -> EventFeed {
        let channel = self.orchestrator.channel();
        let subscription = match resume_from {
            Some(from) => self.bus().subscribe(channel, Some(from)),
            None => self.bus().subscribe_live(channel),
        };
        debug!(subscriber = ?subscription.id(), ?resume_from, "Feed opened");
        EventFeed {
            bus: Arc::clone(self.bus()),
            subscription,
        }
    }

    /// Control input: returns the task id before any work happens.
    pub fn submit(&self, text: impl Into<String>, context: Context) -> ChorusResult<Uuid> {
        self.orchestrator.submit(text, context)
    }

    pub fn cancel(&self, task_id: Uuid) -> ChorusResult<bool> {
        self.orchestrator.cancel(task_id)
    }

    pub fn latest_sequence(&self) -> u64 {
        self.bus().latest_sequence()
    }
}

/// One observer's view of the bus. Unsubscribes when dropped.
pub struct EventFeed {
    bus: Arc<CommandBus>,
    subscription: Subscription,
}

impl EventFeed {
    pub async fn next(&mut self) -> Option<Arc<Event>> {
        self.subscription.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> + Send + 'static {
        futures::stream::unfold(self, |mut feed| async move {
            let event = feed.next().await?;
            Some((event, feed))
        })
    }

    /// Events as JSON text, `{type, source, sequence, timestamp, data}`.
    pub fn into_wire_stream(self) -> impl Stream<Item = String> + Send + 'static {
        futures::stream::unfold(self, |mut feed| async move {
            loop {
                let event = feed.next().await?;
                match event.to_wire() {
                    Ok(text) => return Some((text, feed)),
                    Err(e) => warn!(sequence = event.sequence, error = %e, "Dropping unserializable event"),
                }
            }
        })
    }
}

impl Drop for EventFeed {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription.id());
    }
}
