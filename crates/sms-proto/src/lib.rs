//! Shared protocol types for smsd: the canonical message model, the
//! WebSocket bridge wire packets, the command/service descriptions, and the
//! codecs that turn them into bytes.
//!
//! Binary frames and stored payloads use the packed CBOR form produced by
//! [`codec::encode_packet`] / [`codec::encode_message`]; text frames use the
//! JSON form of the same structures.

pub mod codec;
pub mod command;
pub mod message;
pub mod wire;

mod phone;

pub use codec::CodecError;
pub use command::{
    ArgumentDescription, ArgumentHint, Command, CommandDescription, ExecuteRequest,
    ExecuteResponse, ServiceDescription,
};
pub use message::{Message, MessageBody, MessageFilter, MessageFilters};
pub use phone::{InvalidPhoneNumber, validate_phone_number};
pub use wire::{ErrorBody, Introduction, MessageAcknowledgement, MessageFrame, WebsocketPacket};
