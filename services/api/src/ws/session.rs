//! Manages the event push WebSocket: one bus feed per connection, plus the
//! task control messages.

use super::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chorus_core::{EventFeed, StreamGateway};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Default, Deserialize)]
pub struct ResumeQuery {
    /// Replay retained events with a sequence at or above this one first.
    pub from_sequence: Option<u64>,
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ResumeQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.from_sequence))
}

#[instrument(name = "ws_session", skip_all, fields(session_id, from_sequence))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, from_sequence: Option<u64>) {
    let session_id: u32 = rand::random();
    tracing::Span::current().record("session_id", session_id);
    if let Some(from) = from_sequence {
        tracing::Span::current().record("from_sequence", from);
    }
    info!("New WebSocket connection.");

    // Subscribe before the first await so nothing published from here on is missed.
    let feed = state.gateway.open(from_sequence);
    if let Err(e) = run_session(socket, &state.gateway, feed).await {
        error!(error = ?e, "Session terminated with error.");
    }
    info!("WebSocket connection closed.");
}

async fn run_session(socket: WebSocket, gateway: &StreamGateway, mut feed: EventFeed) -> Result<()> {
    let (mut socket_tx, mut socket_rx) = socket.split();

    loop {
        tokio::select! {
            event = feed.next() => {
                let Some(event) = event else {
                    warn!("Bus feed closed.");
                    break;
                };
                let text = event.to_wire()?;
                socket_tx.send(Message::Text(text.into())).await?;
            },
            msg = socket_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_control(gateway, text.as_str());
                        send_msg(&mut socket_tx, reply).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed the connection.");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => warn!("Ignoring binary message on event socket."),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Err(e)) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                }
            },
        }
    }
    Ok(())
}

/// Applies one control message. Failures become an `error` reply rather than
/// closing the socket.
fn handle_control(gateway: &StreamGateway, text: &str) -> ServerMessage {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::Error {
                message: format!("invalid message: {e}"),
            };
        }
    };
    debug!(?msg, "Control message");
    match msg {
        ClientMessage::SubmitTask { text, context } => {
            match gateway.submit(text, context.unwrap_or_default()) {
                Ok(task_id) => ServerMessage::TaskAccepted { task_id },
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            }
        }
        ClientMessage::CancelTask { task_id } => match gateway.cancel(task_id) {
            Ok(cancelled) => ServerMessage::CancelResult { task_id, cancelled },
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        },
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_control_messages() {
        let state = test_state();
        let gateway = &state.gateway;

        let reply = handle_control(gateway, r#"{"type":"submit_task","text":"   "}"#);
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let reply = handle_control(gateway, "not json");
        assert!(matches!(reply, ServerMessage::Error { message } if message.starts_with("invalid message")));

        let unknown = Uuid::new_v4();
        let reply = handle_control(
            gateway,
            &format!(r#"{{"type":"cancel_task","task_id":"{unknown}"}}"#),
        );
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let reply = handle_control(
            gateway,
            r#"{"type":"submit_task","text":"what's on my calendar today?"}"#,
        );
        let ServerMessage::TaskAccepted { task_id } = reply else {
            panic!("expected task_accepted, got {reply:?}");
        };
        assert!(gateway.orchestrator().task(task_id).is_some());
    }
}
