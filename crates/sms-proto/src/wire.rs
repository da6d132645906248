//! Wire packets for the WebSocket bridge.
//!
//! Every WebSocket frame carries exactly one [`WebsocketPacket`]. The tagged
//! representation guarantees that a packet has exactly one body; a frame
//! whose tag is missing, unknown, or duplicated fails to decode and is
//! treated as a protocol error by the connection that read it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebsocketPacket {
    Introduction(Introduction),
    Message(MessageFrame),
    MessageAcknowledgement(MessageAcknowledgement),
    Error(ErrorBody),
}

/// The mandatory first packet of a bridge session. The initiating side
/// declares the phone numbers it serves and, optionally, the timestamp to
/// replay missed messages from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Introduction {
    pub phone_numbers: Vec<String>,
    /// Replay messages created at or after this instant from the catch-up
    /// queue. Absent means no replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Whether this side replies with acknowledgements when asked to.
    #[serde(default)]
    pub can_acknowledge: bool,
}

/// A message in flight. `acknowledgement_id` is set iff the sender wants a
/// [`MessageAcknowledgement`] carrying the same id back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledgement_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAcknowledgement {
    pub acknowledgement_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A non-fatal error report. Receiving one never closes the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl WebsocketPacket {
    pub fn error(message: impl Into<String>) -> Self {
        WebsocketPacket::Error(ErrorBody {
            message: message.into(),
        })
    }
}
