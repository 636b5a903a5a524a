//! WebSocket endpoints
//!
//! - `protocol`: JSON control messages a client may send, and the replies.
//! - `session`: the event push channel with task submission and cancellation.
//! - `audio`: binary PCM16 stream of the ordered speech for speaker clients.

pub mod audio;
pub mod protocol;
pub mod session;

pub use audio::audio_ws_handler;
pub use session::ws_handler;
