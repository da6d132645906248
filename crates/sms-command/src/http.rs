//! A command service backed by a remote HTTP API.
//!
//! The remote service exposes:
//!   - `GET  {url}/`         — the service description as JSON.
//!   - `POST {url}/execute`  — executes a JSON [`ExecuteRequest`], returning
//!     a JSON [`ExecuteResponse`].
//!   - `GET  {url}/messages` — an SSE stream of `message` events whose data
//!     is a JSON [`Message`]; these are re-emitted through the transport
//!     layer as if the service had sent them itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sms_proto::{ExecuteRequest, ExecuteResponse, Message, MessageFilters, ServiceDescription};
use sms_pubsub::Subscriber;
use sms_transport::{MessageSubscriber, SubscribeError};

use crate::registry::CommandService;

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// A [`CommandService`] that proxies to a remote HTTP service.
pub struct HttpService {
    name: String,
    url: String,
    client: reqwest::Client,
    subs: Subscriber<Message>,
    msgs_tx: mpsc::Sender<Message>,
    msgs_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
}

impl HttpService {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Arc<Self> {
        let (msgs_tx, msgs_rx) = mpsc::channel(16);
        Arc::new(Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            subs: Subscriber::new(),
            msgs_tx,
            msgs_rx: std::sync::Mutex::new(Some(msgs_rx)),
        })
    }

    /// Follows the remote message stream until `cancel` fires, reconnecting
    /// with a fixed delay on failure.
    pub async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let msgs_rx = self
            .msgs_rx
            .lock()
            .unwrap()
            .take()
            .context("service already started")?;

        let follow = async {
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.run_messages_sse(&cancel) => result,
                };
                if let Err(err) = result {
                    tracing::error!(%err, service = %self.name, "message stream failed, retrying");
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        };

        tokio::join!(self.subs.listen(msgs_rx, &cancel), follow);
        Ok(())
    }

    async fn run_messages_sse(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let response = self
            .client
            .get(format!("{}/messages", self.url))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("failed to send request")?;

        if !response.status().is_success() {
            anyhow::bail!("unexpected status code {}", response.status());
        }
        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("text/event-stream") {
            anyhow::bail!("unexpected content type {content_type:?}");
        }

        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(chunk) => chunk.context("stream read failed")?,
                None => anyhow::bail!("message stream ended"),
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by a blank line.
            while let Some(end) = buf.find("\n\n") {
                let event: String = buf.drain(..end + 2).collect();
                if let Some(msg) = parse_sse_message(&event)? {
                    if self.msgs_tx.send(msg).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Executes the remote call shared by `service` and `execute`.
    async fn get_service(&self) -> anyhow::Result<ServiceDescription> {
        let response = self
            .client
            .get(format!("{}/", self.url))
            .send()
            .await
            .context("failed to request service description")?
            .error_for_status()
            .context("service description request failed")?;
        response
            .json()
            .await
            .context("invalid service description")
    }
}

/// Parses one SSE event block, returning the message for `message` events.
fn parse_sse_message(event: &str) -> anyhow::Result<Option<Message>> {
    let mut name = "";
    let mut data = String::new();
    for line in event.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = value.trim();
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim_start());
        }
    }
    if name != "message" || data.is_empty() {
        return Ok(None);
    }
    let msg = serde_json::from_str(&data).context("invalid message event")?;
    Ok(Some(msg))
}

impl MessageSubscriber for HttpService {
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
impl CommandService for HttpService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn service(&self) -> anyhow::Result<ServiceDescription> {
        self.get_service().await
    }

    async fn execute(&self, req: ExecuteRequest) -> anyhow::Result<ExecuteResponse> {
        let response = self
            .client
            .post(format!("{}/execute", self.url))
            .json(&req)
            .send()
            .await
            .context("failed to send execute request")?
            .error_for_status()
            .context("execute request failed")?;
        response.json().await.context("invalid execute response")
    }
}
