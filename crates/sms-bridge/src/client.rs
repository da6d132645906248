//! The outbound half of the bridge: a transport that dials a bridge server
//! and keeps the connection alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use sms_proto::wire::{Introduction, MessageAcknowledgement, MessageFrame};
use sms_proto::{Message, MessageFilters, WebsocketPacket, codec, validate_phone_number};
use sms_pubsub::Subscriber;
use sms_transport::{MessageSender, MessageSubscriber, SendError, SubscribeError};

use crate::acks::AckRegistry;
use crate::frame::{SessionEnd, packet_from_binary, packet_from_text};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Configuration for [`ClientService`].
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// The phone numbers this client sends from and receives for.
    pub phone_numbers: Vec<String>,
    /// The WebSocket address of the bridge server.
    pub ws_address: String,
    /// Extra headers to send when dialing.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// How long to wait for message acknowledgements. Zero disables acks in
    /// both directions.
    #[serde(default)]
    pub acknowledgement_timeout_secs: u64,
}

/// Start options for [`ClientService::start`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Ask the server to replay messages created at or after this instant.
    /// Advanced automatically as messages arrive, so reconnects resume from
    /// the latest seen timestamp.
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct ConnHandle {
    tx: mpsc::Sender<WsMessage>,
}

/// A bridge transport that acts as the WebSocket client.
///
/// The connection is not established until [`start`](Self::start) runs; it
/// redials with a linear `retries * 2s` backoff until cancelled.
pub struct ClientService {
    cfg: ClientConfig,
    subs: Subscriber<Message>,
    msgs_tx: mpsc::Sender<Message>,
    msgs_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    conn: RwLock<Option<ConnHandle>>,
    connected: watch::Sender<bool>,
    acks: Option<Arc<AckRegistry>>,
    /// Unix seconds of the newest dispatched inbound message; 0 means none.
    last_seen: AtomicI64,
}

impl ClientService {
    pub fn new(cfg: ClientConfig) -> Arc<Self> {
        let (msgs_tx, msgs_rx) = mpsc::channel(64);
        let (connected, _) = watch::channel(false);
        let acks = AckRegistry::new(Duration::from_secs(cfg.acknowledgement_timeout_secs));
        Arc::new(Self {
            cfg,
            subs: Subscriber::new(),
            msgs_tx,
            msgs_rx: Mutex::new(Some(msgs_rx)),
            conn: RwLock::new(None),
            connected,
            acks,
            last_seen: AtomicI64::new(0),
        })
    }

    /// Observe connection state changes; true while a session is live.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Runs the client until `cancel` fires: dial, introduce, pump messages,
    /// reconnect on failure.
    pub async fn start(&self, opts: ClientOptions, cancel: CancellationToken) -> anyhow::Result<()> {
        if self.cfg.phone_numbers.is_empty() {
            anyhow::bail!("no phone numbers configured");
        }
        for number in &self.cfg.phone_numbers {
            validate_phone_number(number)?;
        }

        let msgs_rx = self
            .msgs_rx
            .lock()
            .unwrap()
            .take()
            .context("client already started")?;

        if let Some(last_seen) = opts.last_seen {
            self.last_seen.store(last_seen.timestamp(), Ordering::Relaxed);
        }

        tokio::join!(self.subs.listen(msgs_rx, &cancel), self.dial_loop(&cancel));
        Ok(())
    }

    async fn dial_loop(&self, cancel: &CancellationToken) {
        let mut retries = 0u32;
        while !cancel.is_cancelled() {
            tracing::info!(address = %self.cfg.ws_address, "connecting to bridge server");

            let dialed = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.dial() => result,
            };
            let ws = match dialed {
                Ok(ws) => ws,
                Err(err) => {
                    retries += 1;
                    let backoff = RETRY_BACKOFF * retries;
                    tracing::error!(
                        %err,
                        retries,
                        backoff_secs = backoff.as_secs(),
                        "could not dial bridge server, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
            };
            retries = 0;

            let end = self.run_session(ws, cancel).await;
            *self.conn.write().unwrap() = None;
            let _ = self.connected.send(false);

            match &end {
                SessionEnd::Cancelled => return,
                SessionEnd::PeerClosed => {
                    tracing::info!("bridge server closed the connection, reconnecting");
                }
                SessionEnd::Protocol(reason) => {
                    tracing::warn!(reason = %reason, "bridge session failed, reconnecting");
                }
            }
        }
    }

    async fn dial(&self) -> anyhow::Result<WsStream> {
        let mut request = self
            .cfg
            .ws_address
            .as_str()
            .into_client_request()
            .context("invalid bridge server address")?;
        for (name, value) in &self.cfg.headers {
            request.headers_mut().insert(
                name.parse::<HeaderName>().context("invalid header name")?,
                HeaderValue::from_str(value).context("invalid header value")?,
            );
        }

        let (ws, _) = connect_async(request)
            .await
            .context("could not dial bridge server")?;
        Ok(ws)
    }

    async fn run_session(&self, ws: WsStream, cancel: &CancellationToken) -> SessionEnd {
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(64);
        let write_task = tokio::spawn(write_loop(sink, rx));

        let last_seen = self.last_seen.load(Ordering::Relaxed);
        let intro = Introduction {
            phone_numbers: self.cfg.phone_numbers.clone(),
            since: (last_seen > 0).then(|| Utc.timestamp_opt(last_seen, 0).unwrap()),
            can_acknowledge: self.acks.is_some(),
        };

        let end = if send_packet(&tx, &WebsocketPacket::Introduction(intro))
            .await
            .is_err()
        {
            SessionEnd::Protocol("could not send introduction".to_string())
        } else {
            *self.conn.write().unwrap() = Some(ConnHandle { tx: tx.clone() });
            let _ = self.connected.send(true);
            tracing::info!("connected to bridge server");

            self.read_loop(&mut stream, &tx, cancel).await
        };

        let close = WsMessage::Close(Some(CloseFrame {
            code: end.close_code().into(),
            reason: end.close_reason().to_string().into(),
        }));
        let _ = tx.send(close).await;
        drop(tx);
        let _ = write_task.await;
        end
    }

    async fn read_loop(
        &self,
        stream: &mut SplitStream<WsStream>,
        tx: &mpsc::Sender<WsMessage>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                frame = stream.next() => frame,
            };
            let packet = match frame {
                None | Some(Ok(WsMessage::Close(_))) => return SessionEnd::PeerClosed,
                Some(Err(err)) => {
                    return SessionEnd::Protocol(format!("could not read message: {err}"));
                }
                Some(Ok(WsMessage::Binary(bytes))) => match packet_from_binary(&bytes) {
                    Ok(packet) => packet,
                    Err(end) => return end,
                },
                Some(Ok(WsMessage::Text(text))) => match packet_from_text(text.as_str()) {
                    Ok(packet) => packet,
                    Err(end) => return end,
                },
                Some(Ok(_)) => continue, // ping/pong
            };

            match packet {
                WebsocketPacket::Message(frame) => {
                    let msg = frame.message;
                    let timestamp = msg.timestamp.unwrap_or_else(Utc::now);

                    let published = tokio::select! {
                        _ = cancel.cancelled() => return SessionEnd::Cancelled,
                        sent = self.msgs_tx.send(msg) => sent,
                    };
                    if published.is_err() {
                        return SessionEnd::Cancelled;
                    }
                    self.last_seen.store(timestamp.timestamp(), Ordering::Relaxed);

                    if let Some(acknowledgement_id) = frame.acknowledgement_id {
                        let ack = WebsocketPacket::MessageAcknowledgement(MessageAcknowledgement {
                            acknowledgement_id,
                            timestamp,
                        });
                        if send_packet(tx, &ack).await.is_err() {
                            return SessionEnd::Protocol(
                                "could not send message acknowledgement".to_string(),
                            );
                        }
                    }
                }

                WebsocketPacket::MessageAcknowledgement(ack) => {
                    let resolved = self
                        .acks
                        .as_ref()
                        .is_some_and(|acks| acks.acknowledge(&ack.acknowledgement_id));
                    if !resolved {
                        tracing::debug!(
                            acknowledgement_id = %ack.acknowledgement_id,
                            "dropping unknown message acknowledgement"
                        );
                    }
                }

                WebsocketPacket::Error(err) => {
                    tracing::warn!(message = %err.message, "received error message from server");
                }

                WebsocketPacket::Introduction(_) => {
                    return SessionEnd::Protocol("unexpected introduction from server".to_string());
                }
            }
        }
    }
}

impl MessageSubscriber for ClientService {
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
impl MessageSender for ClientService {
    async fn send_message(&self, mut msg: Message) -> Result<(), SendError> {
        if !self.cfg.phone_numbers.contains(&msg.from) {
            return Err(SendError::UnknownSendingNumber(msg.from));
        }
        validate_phone_number(&msg.to)?;

        let handle = self
            .conn
            .read()
            .unwrap()
            .clone()
            .ok_or(SendError::NotConnected)?;

        if msg.timestamp.is_none() {
            msg.timestamp = Some(Utc::now());
        }

        match &self.acks {
            Some(acks) => {
                let (id, waiter) = acks.generate();
                let frame = MessageFrame {
                    message: msg,
                    acknowledgement_id: Some(id.clone()),
                };
                send_packet(&handle.tx, &WebsocketPacket::Message(frame)).await?;
                if acks.wait(waiter).await.is_err() {
                    acks.cancel(&id);
                    return Err(SendError::AckTimeout);
                }
                Ok(())
            }
            None => {
                let frame = MessageFrame {
                    message: msg,
                    acknowledgement_id: None,
                };
                send_packet(&handle.tx, &WebsocketPacket::Message(frame)).await
            }
        }
    }

    fn sending_number(&self) -> Option<(String, f64)> {
        self.cfg
            .phone_numbers
            .first()
            .map(|number| (number.clone(), 0.0))
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

async fn send_packet(
    tx: &mpsc::Sender<WsMessage>,
    packet: &WebsocketPacket,
) -> Result<(), SendError> {
    let bytes = codec::encode_packet(packet).map_err(|err| SendError::Other(err.into()))?;
    tx.send(WsMessage::binary(bytes))
        .await
        .map_err(|_| SendError::NotConnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            phone_numbers: vec!["+15550100".to_string()],
            ws_address: "ws://127.0.0.1:1/sms/ws".to_string(),
            headers: HashMap::new(),
            acknowledgement_timeout_secs: 0,
        }
    }

    #[tokio::test]
    async fn send_rejects_unknown_sending_number() {
        let client = ClientService::new(config());
        let err = client
            .send_message(Message::text("+15550999", "+15550199", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::UnknownSendingNumber(_)));
    }

    #[tokio::test]
    async fn send_rejects_invalid_recipient() {
        let client = ClientService::new(config());
        let err = client
            .send_message(Message::text("+15550100", "not-a-number", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidPhoneNumber(_)));
    }

    #[tokio::test]
    async fn send_requires_a_connection() {
        let client = ClientService::new(config());
        let err = client
            .send_message(Message::text("+15550100", "+15550199", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn start_rejects_empty_phone_numbers() {
        let mut cfg = config();
        cfg.phone_numbers.clear();
        let client = ClientService::new(cfg);
        let err = client
            .start(ClientOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no phone numbers"));
    }
}
