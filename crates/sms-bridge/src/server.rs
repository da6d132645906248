//! The accepting half of the bridge: a transport that serves WebSocket
//! upgrades, routes by introduced phone number, and replays the catch-up
//! queue to reconnecting clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::any;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sms_catchup::{MessageQueue, QueueConfig};
use sms_proto::wire::{Introduction, MessageAcknowledgement, MessageFrame};
use sms_proto::{Message, MessageFilters, WebsocketPacket, codec, validate_phone_number};
use sms_pubsub::Subscriber;
use sms_transport::{MessageSender, MessageSubscriber, SendError, SubscribeError};

use crate::acks::AckRegistry;
use crate::frame::{SessionEnd, packet_from_binary, packet_from_text};

/// Deadline for delivering one outbound message to one connection,
/// including its acknowledgement wait.
const FANOUT_DEADLINE: Duration = Duration::from_secs(10);

/// Configuration for [`ServerService`].
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// The phone numbers this server sends from.
    pub phone_numbers: Vec<String>,
    /// The catch-up queue. Absent disables replay and persistence.
    #[serde(default)]
    pub message_queue: Option<QueueConfig>,
    /// How long to wait for message acknowledgements. Zero disables acks.
    #[serde(default)]
    pub acknowledgement_timeout_secs: u64,
}

#[derive(Clone)]
struct ClientConn {
    tx: mpsc::Sender<WsMessage>,
    can_acknowledge: bool,
}

/// A bridge transport that accepts WebSocket clients.
pub struct ServerService {
    cfg: ServerConfig,
    subs: Subscriber<Message>,
    msgs_tx: mpsc::Sender<Message>,
    msgs_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    /// phone number -> connection id -> connection.
    conns: Mutex<HashMap<String, HashMap<u64, ClientConn>>>,
    next_conn_id: AtomicU64,
    acks: Option<Arc<AckRegistry>>,
    queue: Option<MessageQueue>,
    /// Cancelled when the service shuts down; every connection watches it.
    shutdown: CancellationToken,
}

impl ServerService {
    /// Creates the service, opening the catch-up queue if one is configured.
    pub async fn open(cfg: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let queue = match &cfg.message_queue {
            Some(queue_cfg) => Some(
                MessageQueue::open(queue_cfg)
                    .await
                    .context("could not open catch-up message queue")?,
            ),
            None => None,
        };

        let (msgs_tx, msgs_rx) = mpsc::channel(64);
        let acks = AckRegistry::new(Duration::from_secs(cfg.acknowledgement_timeout_secs));
        Ok(Arc::new(Self {
            cfg,
            subs: Subscriber::new(),
            msgs_tx,
            msgs_rx: Mutex::new(Some(msgs_rx)),
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            acks,
            queue,
            shutdown: CancellationToken::new(),
        }))
    }

    /// The router serving the WebSocket endpoint at `/`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", any(Self::ws_handler))
            .with_state(self.clone())
    }

    /// Runs the broadcast fabric, the re-broadcast loop and the retention
    /// sweeper until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
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
            .context("server already started")?;

        // Every message published on the fabric is also pushed back out to
        // the connections registered under its recipient number, so two
        // bridged clients can reach each other through this server.
        let (loop_tx, mut loop_rx) = mpsc::channel::<Message>(64);
        self.subs
            .subscribe(loop_tx.clone(), None)
            .map_err(|err| anyhow::anyhow!(err))?;

        let rebroadcast = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = loop_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(err) = self.deliver(msg).await {
                                tracing::warn!(%err, "could not re-broadcast inbound message");
                            }
                        }
                        None => break,
                    },
                }
            }
        };

        let retention = async {
            if let Some(queue) = &self.queue {
                queue.run_retention(cancel.child_token()).await;
            }
        };

        let propagate = async {
            cancel.cancelled().await;
            self.shutdown.cancel();
        };

        tokio::join!(
            self.subs.listen(msgs_rx, &cancel),
            rebroadcast,
            retention,
            propagate,
        );

        self.subs.unsubscribe(&loop_tx);
        tracing::info!("stopped processing messages");
        Ok(())
    }

    async fn ws_handler(
        State(service): State<Arc<ServerService>>,
        ws: WebSocketUpgrade,
    ) -> Response {
        ws.on_upgrade(move |socket| async move { service.handle_socket(socket).await })
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        tracing::info!("accepted new bridge connection");

        let (sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(64);
        let write_task = tokio::spawn(write_loop(sink, rx));

        let end = self.run_connection(&mut stream, &tx).await;
        if let SessionEnd::Protocol(reason) = &end {
            let _ = send_packet(&tx, &WebsocketPacket::error(reason.clone())).await;
        }

        let close = WsMessage::Close(Some(CloseFrame {
            code: end.close_code(),
            reason: end.close_reason().to_string().into(),
        }));
        let _ = tx.send(close).await;
        drop(tx);
        let _ = write_task.await;

        tracing::info!(reason = end.close_reason(), "bridge connection closed");
    }

    async fn run_connection(
        &self,
        stream: &mut (impl Stream<Item = Result<WsMessage, axum::Error>> + Unpin),
        tx: &mpsc::Sender<WsMessage>,
    ) -> SessionEnd {
        // The first packet must be an introduction.
        let intro = match self.next_packet(stream).await {
            Ok(Some(WebsocketPacket::Introduction(intro))) => intro,
            Ok(Some(_)) => {
                return SessionEnd::Protocol("expected introduction as first packet".to_string());
            }
            Ok(None) => return SessionEnd::PeerClosed,
            Err(end) => return end,
        };
        for number in &intro.phone_numbers {
            if let Err(err) = validate_phone_number(number) {
                return SessionEnd::Protocol(err.to_string());
            }
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.register(conn_id, &intro, tx.clone());
        tracing::info!(
            client_phone_numbers = ?intro.phone_numbers,
            can_acknowledge = intro.can_acknowledge,
            "registered bridge client"
        );

        let end = self.serve_connection(stream, tx, &intro).await;
        self.unregister(conn_id, &intro.phone_numbers);
        end
    }

    async fn serve_connection(
        &self,
        stream: &mut (impl Stream<Item = Result<WsMessage, axum::Error>> + Unpin),
        tx: &mpsc::Sender<WsMessage>,
        intro: &Introduction,
    ) -> SessionEnd {
        if let (Some(queue), Some(since)) = (&self.queue, intro.since) {
            tracing::debug!(
                since = %since,
                phone_numbers = ?intro.phone_numbers,
                "catching client up to messages"
            );
            let mut replay = queue.retrieve(since, intro.phone_numbers.clone());
            while let Some(result) = replay.recv().await {
                match result {
                    Ok(message) => {
                        let frame = WebsocketPacket::Message(MessageFrame {
                            message,
                            acknowledgement_id: None,
                        });
                        if send_packet(tx, &frame).await.is_err() {
                            return SessionEnd::PeerClosed;
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "could not retrieve all catchup messages");
                        let error =
                            WebsocketPacket::error("could not retrieve all catchup messages");
                        let _ = send_packet(tx, &error).await;
                        break;
                    }
                }
            }
        }

        loop {
            let packet = match self.next_packet(stream).await {
                Ok(Some(packet)) => packet,
                Ok(None) => return SessionEnd::PeerClosed,
                Err(end) => return end,
            };

            match packet {
                WebsocketPacket::Message(frame) => {
                    let mut msg = frame.message;
                    // The server's clock is authoritative for inbound
                    // messages; it is also what the acknowledgement carries.
                    let timestamp = Utc::now();
                    msg.timestamp = Some(timestamp);

                    if let Some(queue) = &self.queue
                        && let Err(err) = queue.store(&msg).await
                    {
                        // The message was already accepted; keep going.
                        tracing::error!(%err, "could not store message in queue");
                    }

                    let published = tokio::select! {
                        _ = self.shutdown.cancelled() => return SessionEnd::Cancelled,
                        sent = self.msgs_tx.send(msg) => sent,
                    };
                    if published.is_err() {
                        return SessionEnd::Cancelled;
                    }

                    if let Some(acknowledgement_id) = frame.acknowledgement_id {
                        tracing::debug!(%acknowledgement_id, "replying with message acknowledgement");
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
                    if let Some(acks) = &self.acks
                        && !acks.acknowledge(&ack.acknowledgement_id)
                    {
                        let error = WebsocketPacket::error("unknown acknowledgement ID");
                        let _ = send_packet(tx, &error).await;
                    }
                }

                WebsocketPacket::Error(err) => {
                    tracing::warn!(message = %err.message, "received error message from client");
                }

                WebsocketPacket::Introduction(_) => {
                    return SessionEnd::Protocol("unexpected repeated introduction".to_string());
                }
            }
        }
    }

    async fn next_packet(
        &self,
        stream: &mut (impl Stream<Item = Result<WsMessage, axum::Error>> + Unpin),
    ) -> Result<Option<WebsocketPacket>, SessionEnd> {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SessionEnd::Cancelled),
                frame = stream.next() => frame,
            };
            return match frame {
                None | Some(Ok(WsMessage::Close(_))) => Ok(None),
                Some(Err(err)) => Err(SessionEnd::Protocol(format!(
                    "could not read message: {err}"
                ))),
                Some(Ok(WsMessage::Binary(bytes))) => packet_from_binary(&bytes).map(Some),
                Some(Ok(WsMessage::Text(text))) => packet_from_text(text.as_str()).map(Some),
                Some(Ok(_)) => continue, // ping/pong
            };
        }
    }

    fn register(&self, conn_id: u64, intro: &Introduction, tx: mpsc::Sender<WsMessage>) {
        let conn = ClientConn {
            tx,
            can_acknowledge: intro.can_acknowledge,
        };
        let mut conns = self.conns.lock().unwrap();
        for number in &intro.phone_numbers {
            conns
                .entry(number.clone())
                .or_default()
                .insert(conn_id, conn.clone());
        }
    }

    fn unregister(&self, conn_id: u64, phone_numbers: &[String]) {
        let mut conns = self.conns.lock().unwrap();
        for number in phone_numbers {
            if let Some(by_id) = conns.get_mut(number) {
                by_id.remove(&conn_id);
                if by_id.is_empty() {
                    conns.remove(number);
                }
            }
        }
    }

    /// Stores `msg` and fans it out to every connection registered under its
    /// recipient number. Storage failure fails the send; delivery failures
    /// are logged and counted only.
    async fn deliver(&self, mut msg: Message) -> Result<(), SendError> {
        if msg.timestamp.is_none() {
            msg.timestamp = Some(Utc::now());
        }

        if let Some(queue) = &self.queue {
            queue
                .store(&msg)
                .await
                .map_err(|err| SendError::Storage(err.to_string()))?;
        }

        let targets: Vec<ClientConn> = {
            let conns = self.conns.lock().unwrap();
            match conns.get(&msg.to) {
                Some(by_id) => by_id.values().cloned().collect(),
                None => return Ok(()),
            }
        };

        let clients = targets.len();
        let mut deliveries = JoinSet::new();
        for conn in targets {
            let msg = msg.clone();
            let acks = self.acks.clone();
            deliveries.spawn(async move {
                match tokio::time::timeout(FANOUT_DEADLINE, deliver_one(conn, msg, acks)).await {
                    Ok(delivered) => delivered,
                    Err(_) => {
                        tracing::info!("timed out delivering message to bridge client");
                        false
                    }
                }
            });
        }

        let mut delivered = 0usize;
        while let Some(result) = deliveries.join_next().await {
            if matches!(result, Ok(true)) {
                delivered += 1;
            }
        }

        tracing::debug!(to = %msg.to, clients, delivered, "sent message to bridge clients");
        Ok(())
    }
}

/// Delivers one message to one connection, waiting for the acknowledgement
/// when the client can provide one. Returns whether the write went through.
async fn deliver_one(conn: ClientConn, msg: Message, acks: Option<Arc<AckRegistry>>) -> bool {
    let to = msg.to.clone();

    let pending = match (&acks, conn.can_acknowledge) {
        (Some(acks), true) => {
            let (id, waiter) = acks.generate();
            Some((acks.clone(), id, waiter))
        }
        _ => None,
    };

    let frame = WebsocketPacket::Message(MessageFrame {
        message: msg,
        acknowledgement_id: pending.as_ref().map(|(_, id, _)| id.clone()),
    });
    if send_packet(&conn.tx, &frame).await.is_err() {
        if let Some((acks, id, _)) = &pending {
            acks.cancel(id);
        }
        tracing::info!(%to, "could not deliver message to bridge client");
        return false;
    }

    if let Some((acks, id, waiter)) = pending
        && acks.wait(waiter).await.is_err()
    {
        acks.cancel(&id);
        tracing::info!(%to, "timed out waiting for message acknowledgement");
    }

    true
}

impl MessageSubscriber for ServerService {
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
impl MessageSender for ServerService {
    async fn send_message(&self, msg: Message) -> Result<(), SendError> {
        if !self.cfg.phone_numbers.contains(&msg.from) {
            return Err(SendError::UnknownSendingNumber(msg.from));
        }
        validate_phone_number(&msg.to)?;
        self.deliver(msg).await
    }

    fn sending_number(&self) -> Option<(String, f64)> {
        // Not round robin, just the first number.
        self.cfg
            .phone_numbers
            .first()
            .map(|number| (number.clone(), 0.0))
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
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
