//! Shared framing details: how a read loop ends and which close code that
//! maps to.

use sms_proto::{CodecError, WebsocketPacket, codec};

/// Why a bridge session's read loop stopped.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// The peer closed cleanly (EOF or close frame).
    PeerClosed,
    /// The local side is shutting down.
    Cancelled,
    /// A malformed frame, unexpected packet, or socket failure.
    Protocol(String),
}

impl SessionEnd {
    /// The WebSocket close code to send: 1000 normal, 1001 going away,
    /// 1002 protocol error.
    pub(crate) fn close_code(&self) -> u16 {
        match self {
            SessionEnd::PeerClosed => 1000,
            SessionEnd::Cancelled => 1001,
            SessionEnd::Protocol(_) => 1002,
        }
    }

    pub(crate) fn close_reason(&self) -> &str {
        match self {
            SessionEnd::PeerClosed => "",
            SessionEnd::Cancelled => "context cancelled",
            SessionEnd::Protocol(reason) => reason,
        }
    }
}

/// Decodes a binary frame payload, mapping failures to a protocol error.
pub(crate) fn packet_from_binary(bytes: &[u8]) -> Result<WebsocketPacket, SessionEnd> {
    codec::decode_packet(bytes).map_err(decode_error)
}

/// Decodes a text frame payload, mapping failures to a protocol error.
pub(crate) fn packet_from_text(text: &str) -> Result<WebsocketPacket, SessionEnd> {
    codec::decode_packet_json(text).map_err(decode_error)
}

fn decode_error(err: CodecError) -> SessionEnd {
    SessionEnd::Protocol(format!("could not decode message: {err}"))
}
