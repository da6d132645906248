//! The WebSocket bridge transport.
//!
//! The bridge proxies message sends and receives over a WebSocket: the
//! server half accepts connections, registers each under the phone numbers
//! it introduces, replays missed messages from the catch-up queue, and fans
//! outbound messages out to every connection registered under the target
//! number. The client half dials out, introduces itself, and surfaces the
//! server's messages as a regular transport. Both halves share the packet
//! framing and the acknowledgement registry.

mod acks;
mod client;
mod frame;
mod server;

pub use acks::{AckRegistry, AckTimeout, AckWaiter};
pub use client::{ClientConfig, ClientOptions, ClientService};
pub use server::{ServerConfig, ServerService};
