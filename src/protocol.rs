//! Push-connection message envelope.
//!
//! Every WebSocket text frame is a JSON object of the form
//! `{"event": <name>, "data": <payload>}`. The event names match the ones the
//! browser client listens for.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event name for the one-shot session identifier.
pub const EVENT_ID: &str = "id";

/// Event name for both client commands and backend output.
pub const EVENT_CHAT_MESSAGE: &str = "chat message";

/// Sent as the last chat message before the server closes a session.
pub const DISCONNECTED_NOTICE: &str = "DISCONNECTED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushMessage {
    #[serde(rename = "id")]
    Id(u32),
    #[serde(rename = "chat message")]
    ChatMessage(String),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed push message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl PushMessage {
    pub fn encode(&self) -> String {
        // Serializing a tagged enum of a u32 or a String cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn disconnected() -> Self {
        PushMessage::ChatMessage(DISCONNECTED_NOTICE.to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            PushMessage::Id(_) => EVENT_ID,
            PushMessage::ChatMessage(_) => EVENT_CHAT_MESSAGE,
        }
    }
}
