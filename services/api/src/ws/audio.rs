//! Speaker WebSocket: streams the sequencer's output as binary PCM16 frames.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, instrument, warn};

use crate::state::AppState;

pub async fn audio_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| stream_audio(socket, state))
}

#[instrument(name = "audio_session", skip_all, fields(session_id))]
async fn stream_audio(socket: WebSocket, state: Arc<AppState>) {
    let session_id: u32 = rand::random();
    tracing::Span::current().record("session_id", session_id);
    info!(sample_rate = state.speaker.sample_rate(), "Speaker connected.");

    let mut frames = state.speaker.subscribe();
    let (mut socket_tx, mut socket_rx) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(bytes) => {
                    if socket_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Speaker fell behind; frames dropped.");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    info!("Speaker disconnected.");
}
