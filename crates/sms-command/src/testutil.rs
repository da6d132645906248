//! Test doubles shared by the unit tests in this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sms_proto::{ExecuteRequest, ExecuteResponse, Message, MessageFilters, ServiceDescription};
use sms_pubsub::Subscriber;
use sms_transport::{MessageSender, MessageSubscriber, SendError, SubscribeError};

use crate::registry::CommandService;

type Responder = Box<dyn Fn(ExecuteRequest) -> anyhow::Result<ExecuteResponse> + Send + Sync>;

/// A command service with a fixed description and an optional canned
/// responder.
pub struct StaticService {
    description: ServiceDescription,
    responder: Option<Responder>,
    subs: Subscriber<Message>,
}

impl StaticService {
    pub fn new(description: ServiceDescription) -> Arc<Self> {
        Arc::new(Self {
            description,
            responder: None,
            subs: Subscriber::new(),
        })
    }

    pub fn with_responder(
        description: ServiceDescription,
        responder: impl Fn(ExecuteRequest) -> anyhow::Result<ExecuteResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            description,
            responder: Some(Box::new(responder)),
            subs: Subscriber::new(),
        })
    }
}

impl MessageSubscriber for StaticService {
    fn subscribe_messages(
        &self,
        channel: mpsc::Sender<Message>,
        filters: Option<MessageFilters>,
    ) -> Result<(), SubscribeError> {
        self.subs
            .subscribe(channel, sms_transport::filter_predicate(filters))
    }

    fn unsubscribe_messages(&self, channel: &mpsc::Sender<Message>) {
        self.subs.unsubscribe(channel);
    }
}

#[async_trait]
impl CommandService for StaticService {
    fn name(&self) -> &str {
        &self.description.name
    }

    async fn service(&self) -> anyhow::Result<ServiceDescription> {
        Ok(self.description.clone())
    }

    async fn execute(&self, req: ExecuteRequest) -> anyhow::Result<ExecuteResponse> {
        match &self.responder {
            Some(responder) => responder(req),
            None => anyhow::bail!("not implemented"),
        }
    }
}

/// A transport whose inbound side is driven by the test and whose outbound
/// side is recorded.
pub struct LoopbackTransport {
    subs: Subscriber<Message>,
    sent_tx: mpsc::UnboundedSender<Message>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            subs: Subscriber::new(),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        })
    }

    /// Delivers `msg` to every subscriber, as if it arrived off the wire.
    pub fn inject(&self, msg: Message) {
        self.subs.publish(&msg);
    }

    /// The next message sent outward; panics after a second of nothing.
    pub async fn next_sent(&self) -> Message {
        let mut rx = self.sent_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for an outbound message")
            .expect("send channel closed")
    }
}

impl MessageSubscriber for LoopbackTransport {
    fn subscribe_messages(
        &self,
        channel: mpsc::Sender<Message>,
        filters: Option<MessageFilters>,
    ) -> Result<(), SubscribeError> {
        self.subs
            .subscribe(channel, sms_transport::filter_predicate(filters))
    }

    fn unsubscribe_messages(&self, channel: &mpsc::Sender<Message>) {
        self.subs.unsubscribe(channel);
    }
}

#[async_trait]
impl MessageSender for LoopbackTransport {
    async fn send_message(&self, msg: Message) -> Result<(), SendError> {
        self.sent_tx
            .send(msg)
            .map_err(|_| SendError::NotConnected)
    }
}
