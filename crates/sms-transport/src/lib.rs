//! Transport traits: the seam between concrete SMS transports (the WebSocket
//! bridge, carrier REST providers) and everything that consumes messages
//! (the command dispatcher, command services).

mod combined;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sms_proto::{InvalidPhoneNumber, Message, MessageBody, MessageFilters};
pub use sms_pubsub::SubscribeError;

pub use combined::CombinedService;

/// A service that can deliver incoming messages to subscribers.
pub trait MessageSubscriber: Send + Sync {
    /// Begins delivering messages matching `filters` to `channel`. The
    /// filters are AND'd; `None` accepts everything.
    fn subscribe_messages(
        &self,
        channel: mpsc::Sender<Message>,
        filters: Option<MessageFilters>,
    ) -> Result<(), SubscribeError>;

    /// Stops delivering to `channel`. The transport drops its senders; the
    /// channel closes once the caller drops theirs too.
    fn unsubscribe_messages(&self, channel: &mpsc::Sender<Message>);
}

/// A service that can send messages outward.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, msg: Message) -> Result<(), SendError>;

    /// The preferred number to send from and its cost in `[0.0, 1.0]`.
    /// Lower costs are chosen first. `None` if this sender has no number of
    /// its own.
    fn sending_number(&self) -> Option<(String, f64)> {
        None
    }

    /// Replies to `original` with `body`.
    ///
    /// The default swaps `from`/`to` and sends a fresh message; transports
    /// with a synchronous reply fast path override this.
    async fn reply_message(&self, original: &Message, body: MessageBody) -> Result<(), SendError> {
        self.send_message(reply_to(original, body)).await
    }
}

/// A full transport: both halves together.
pub trait MessageService: MessageSubscriber + MessageSender {}

impl<T: MessageSubscriber + MessageSender + ?Sized> MessageService for T {}

/// Why an outbound send failed. Kinds are distinguishable so callers can
/// tell a validation problem from a transient one.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unknown phone number {0:?} to send from")]
    UnknownSendingNumber(String),
    #[error(transparent)]
    InvalidPhoneNumber(#[from] InvalidPhoneNumber),
    #[error("transport not connected")]
    NotConnected,
    #[error("timed out waiting for message acknowledgement")]
    AckTimeout,
    #[error("could not persist message: {0}")]
    Storage(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Adapts a wire-level filter set into a fabric predicate. `None` (and the
/// empty set) accept every message.
pub fn filter_predicate(
    filters: Option<MessageFilters>,
) -> Option<sms_pubsub::FilterFn<Message>> {
    filters.map(|filters| {
        Box::new(move |msg: &Message| filters.matches(msg)) as sms_pubsub::FilterFn<Message>
    })
}

/// Builds the message that replies to `original` with `body`: the addresses
/// swap and the transport stamps the timestamp.
pub fn reply_to(original: &Message, body: MessageBody) -> Message {
    Message {
        from: original.to.clone(),
        to: original.from.clone(),
        timestamp: None,
        body,
    }
}

/// Sends a text message from `from` to `to` through `sender`.
pub async fn send_text(
    sender: &dyn MessageSender,
    from: &str,
    to: &str,
    text: impl Into<String>,
) -> Result<(), SendError> {
    sender
        .send_message(Message::text(from, to, text))
        .await
}

/// Sends a text message to `to` from the sender's own preferred number.
pub async fn send_auto_text(
    sender: &dyn MessageSender,
    to: &str,
    text: impl Into<String>,
) -> Result<(), SendError> {
    let (from, _) = sender.sending_number().ok_or(SendError::NotConnected)?;
    send_text(sender, &from, to, text).await
}
