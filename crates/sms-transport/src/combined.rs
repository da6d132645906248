//! The transport aggregator: several [`MessageService`]s behind one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sms_proto::{Message, MessageBody, MessageFilters};

use crate::{MessageSender, MessageService, MessageSubscriber, SendError, SubscribeError};

/// Combines an ordered list of transports into a single service.
///
/// Subscribing and unsubscribing broadcast to every member. Sending tries
/// each member in order and returns on the first success; if every member
/// fails, the last error is returned. This is deliberately the whole routing
/// model — richer multi-carrier routing belongs in a dedicated service.
pub struct CombinedService {
    services: Vec<Arc<dyn MessageService>>,
}

impl CombinedService {
    pub fn new(services: Vec<Arc<dyn MessageService>>) -> Self {
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl MessageSubscriber for CombinedService {
    fn subscribe_messages(
        &self,
        channel: mpsc::Sender<Message>,
        filters: Option<MessageFilters>,
    ) -> Result<(), SubscribeError> {
        let mut first_err = None;
        for service in &self.services {
            if let Err(err) = service.subscribe_messages(channel.clone(), filters.clone()) {
                tracing::warn!(%err, "transport rejected subscription");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn unsubscribe_messages(&self, channel: &mpsc::Sender<Message>) {
        for service in &self.services {
            service.unsubscribe_messages(channel);
        }
    }
}

#[async_trait]
impl MessageSender for CombinedService {
    async fn send_message(&self, msg: Message) -> Result<(), SendError> {
        let mut last_err = SendError::NotConnected;
        for service in &self.services {
            match service.send_message(msg.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(%err, to = %msg.to, "transport could not send, trying next");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn sending_number(&self) -> Option<(String, f64)> {
        self.services
            .iter()
            .filter_map(|service| service.sending_number())
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
    }

    async fn reply_message(&self, original: &Message, body: MessageBody) -> Result<(), SendError> {
        let mut last_err = SendError::NotConnected;
        for service in &self.services {
            match service.reply_message(original, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}
