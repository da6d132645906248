//! The dispatcher: reads messages off a transport, parses them into
//! commands, executes, and replies on the same transport.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sms_proto::{ExecuteRequest, Message, MessageBody, MessageFilters};
use sms_transport::{MessageSender, MessageService, MessageSubscriber};

use crate::registry::ServiceRegistry;
use crate::slash::CommandParser;

/// Wires a transport, a set of parsers and the service registry together.
pub struct Dispatcher {
    sms: Arc<dyn MessageService>,
    parsers: Vec<Arc<dyn CommandParser>>,
    services: Arc<ServiceRegistry>,
    /// Optional filters restricting which messages are dispatched.
    filters: Option<MessageFilters>,
}

impl Dispatcher {
    pub fn new(
        sms: Arc<dyn MessageService>,
        parsers: Vec<Arc<dyn CommandParser>>,
        services: Arc<ServiceRegistry>,
        filters: Option<MessageFilters>,
    ) -> Self {
        Self {
            sms,
            parsers,
            services,
            filters,
        }
    }

    /// Runs until `cancel` fires. Each message dispatches on its own task;
    /// shutdown waits for in-flight dispatches to finish.
    pub async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel::<Message>(16);
        self.sms
            .subscribe_messages(tx.clone(), self.filters.clone())
            .context("could not subscribe to messages")?;

        let mut inflight = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                // Reap finished dispatches so the set does not grow.
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        let sms = self.sms.clone();
                        let parsers = self.parsers.clone();
                        let services = self.services.clone();
                        inflight.spawn(async move {
                            dispatch(sms, &parsers, &services, msg).await;
                        });
                    }
                    None => break Err(anyhow::anyhow!("message channel closed")),
                },
            }
        };

        self.sms.unsubscribe_messages(&tx);
        while inflight.join_next().await.is_some() {}
        result
    }
}

async fn dispatch(
    sms: Arc<dyn MessageService>,
    parsers: &[Arc<dyn CommandParser>],
    services: &ServiceRegistry,
    msg: Message,
) {
    tracing::debug!(from = %msg.from, to = %msg.to, "dispatching message");

    let mut parsed = None;
    for parser in parsers {
        match parser.parse(services, &msg.body).await {
            Ok(Some(command)) => {
                parsed = Some((parser, command));
                break;
            }
            Ok(None) => continue,
            Err(err) => {
                reply(&*sms, &msg, MessageBody::text(format!("failed to parse command: {err:#}")))
                    .await;
                return;
            }
        }
    }

    let Some((parser, command)) = parsed else {
        reply(
            &*sms,
            &msg,
            MessageBody::text("cannot understand command (no available parser)"),
        )
        .await;
        return;
    };

    let Some(service) = services.get(&command.service) else {
        tracing::error!(
            parser = parser.name(),
            service = %command.service,
            "parser returned unknown service (bug)"
        );
        return;
    };

    let request = ExecuteRequest {
        command,
        message: msg.clone(),
    };
    match service.execute(request).await {
        Ok(response) => reply(&*sms, &msg, response.into_body()).await,
        Err(err) => {
            tracing::error!(%err, service = service.name(), "failed to execute command");
            reply(
                &*sms,
                &msg,
                MessageBody::text("an error occurred while executing the command"),
            )
            .await;
        }
    }
}

async fn reply(sms: &dyn MessageService, msg: &Message, body: MessageBody) {
    tracing::debug!(to = %msg.from, "replying with message");
    if let Err(err) = sms.reply_message(msg, body).await {
        tracing::error!(%err, "failed to send reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CommandService;
    use crate::slash::SlashParser;
    use crate::testutil::{LoopbackTransport, StaticService};
    use sms_proto::{
        ArgumentDescription, ArgumentHint, CommandDescription, ExecuteResponse,
        ServiceDescription,
    };
    use std::time::Duration;

    fn ping_service() -> Arc<StaticService> {
        let arguments = [(
            "message".to_string(),
            ArgumentDescription {
                required: true,
                hint: ArgumentHint::Unspecified,
            },
        )]
        .into_iter()
        .collect();
        StaticService::with_responder(
            ServiceDescription {
                name: "ping".to_string(),
                commands: vec![CommandDescription {
                    name: "echo".to_string(),
                    arguments,
                    argument_positions: vec!["message".to_string()],
                    argument_trailing: true,
                }],
            },
            |req| {
                let text = req.command.argument("message").unwrap_or_default();
                Ok(ExecuteResponse::text(format!("pong: {text}")))
            },
        )
    }

    async fn run_dispatcher(
        transport: &Arc<LoopbackTransport>,
        service: Arc<dyn CommandService>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(service);

        let dispatcher = Dispatcher::new(
            transport.clone() as Arc<dyn MessageService>,
            vec![Arc::new(SlashParser::new()) as Arc<dyn CommandParser>],
            registry,
            None,
        );

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher.start(cancel).await.unwrap();
            })
        };
        // Give the dispatcher a beat to subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;
        (cancel, handle)
    }

    #[tokio::test]
    async fn executes_and_replies_on_the_same_transport() {
        let transport = LoopbackTransport::new();
        let (cancel, handle) = run_dispatcher(&transport, ping_service()).await;

        transport.inject(Message::text("+15550100", "+15550199", "/ping echo hello there"));

        let reply = transport.next_sent().await;
        assert_eq!(reply.from, "+15550199");
        assert_eq!(reply.to, "+15550100");
        assert_eq!(reply.body.as_text(), Some("pong: hello there"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn parse_errors_are_reported_to_the_user() {
        let transport = LoopbackTransport::new();
        let (cancel, handle) = run_dispatcher(&transport, ping_service()).await;

        transport.inject(Message::text("+15550100", "+15550199", "/ping nosuch x"));

        let reply = transport.next_sent().await;
        let text = reply.body.as_text().unwrap();
        assert!(text.contains("failed to parse command"), "{text}");
        assert!(text.contains("unknown command"), "{text}");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unparseable_bodies_get_a_generic_reply() {
        let transport = LoopbackTransport::new();
        let (cancel, handle) = run_dispatcher(&transport, ping_service()).await;

        transport.inject(Message::text("+15550100", "+15550199", "just chatting"));

        let reply = transport.next_sent().await;
        assert_eq!(
            reply.body.as_text(),
            Some("cannot understand command (no available parser)"),
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn execution_failures_reply_generically() {
        let transport = LoopbackTransport::new();
        let failing = StaticService::with_responder(
            ServiceDescription {
                name: "ping".to_string(),
                commands: vec![CommandDescription {
                    name: "echo".to_string(),
                    ..Default::default()
                }],
            },
            |_| anyhow::bail!("database exploded"),
        );
        let (cancel, handle) = run_dispatcher(&transport, failing).await;

        transport.inject(Message::text("+15550100", "+15550199", "/ping echo"));

        let reply = transport.next_sent().await;
        let text = reply.body.as_text().unwrap();
        // Internals must not leak into the user-visible reply.
        assert_eq!(text, "an error occurred while executing the command");

        cancel.cancel();
        handle.await.unwrap();
    }
}
