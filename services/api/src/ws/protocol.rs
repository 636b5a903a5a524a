//! Defines the WebSocket control protocol between a client and the API server.
//!
//! Bus events are pushed verbatim as `{type, source, sequence, timestamp, data}`
//! text frames; the messages below are the only other traffic.

use chorus_core::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Starts a new task; answered with `task_accepted`.
    SubmitTask {
        text: String,
        #[serde(default)]
        context: Option<Context>,
    },
    /// Requests cancellation; answered with `cancel_result`.
    CancelTask { task_id: Uuid },
}

/// Replies to control messages. Their `type` values never collide with
/// event kinds.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TaskAccepted { task_id: Uuid },
    CancelResult { task_id: Uuid, cancelled: bool },
    /// A control message was rejected; the push channel stays open.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse() {
        let submit: ClientMessage =
            serde_json::from_value(json!({"type": "submit_task", "text": "weather in Rome"}))
                .unwrap();
        assert_eq!(
            submit,
            ClientMessage::SubmitTask {
                text: "weather in Rome".into(),
                context: None
            }
        );

        let id = Uuid::new_v4();
        let cancel: ClientMessage =
            serde_json::from_value(json!({"type": "cancel_task", "task_id": id})).unwrap();
        assert_eq!(cancel, ClientMessage::CancelTask { task_id: id });

        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "init"})).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let id = Uuid::nil();
        let value = serde_json::to_value(ServerMessage::CancelResult {
            task_id: id,
            cancelled: true,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "cancel_result", "task_id": id, "cancelled": true})
        );
    }
}
