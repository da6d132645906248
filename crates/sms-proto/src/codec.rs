//! Packet and message codecs.
//!
//! The packed binary form is CBOR and is canonical: it is what binary
//! WebSocket frames carry and what the catch-up queue persists. The text form
//! is JSON of the same serde model and is accepted anywhere the binary form
//! is.

use crate::message::Message;
use crate::wire::WebsocketPacket;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("could not encode: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("could not decode: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
    #[error("could not decode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a packet into its packed binary frame payload.
pub fn encode_packet(packet: &WebsocketPacket) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(packet, &mut buf)?;
    Ok(buf)
}

/// Decodes a packet from a binary frame payload.
pub fn decode_packet(bytes: &[u8]) -> Result<WebsocketPacket, CodecError> {
    Ok(ciborium::from_reader(bytes)?)
}

/// Encodes a packet into its text-JSON frame payload.
pub fn encode_packet_json(packet: &WebsocketPacket) -> Result<String, CodecError> {
    Ok(serde_json::to_string(packet)?)
}

/// Decodes a packet from a text frame payload.
pub fn decode_packet_json(text: &str) -> Result<WebsocketPacket, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a message into the canonical binary form stored by the catch-up
/// queue.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(msg, &mut buf)?;
    Ok(buf)
}

/// Decodes a message from its canonical binary form.
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(ciborium::from_reader(bytes)?)
}
