//! Server-sent events: the same ordered bus feed as `/ws`, for clients that
//! only need to listen.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{error, info};

use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Resume point; omitted means live events only.
    pub from: Option<u64>,
}

pub async fn events_handler(
    Query(query): Query<EventsQuery>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    info!(from = ?query.from, "SSE client connected.");
    let stream = state
        .gateway
        .open(query.from)
        .into_stream()
        .filter_map(|event| async move {
            match event.to_wire() {
                Ok(data) => Some(Ok::<_, Infallible>(SseEvent::default()
                    .event(event.kind().as_str())
                    .id(event.sequence.to_string())
                    .data(data))),
                Err(e) => {
                    error!(sequence = event.sequence, error = %e, "Failed to encode event");
                    None
                }
            }
        });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
