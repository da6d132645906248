//! Assembles the configured transports, parsers and services, and runs them
//! under one supervised task group.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sms_bridge::{ClientOptions, ClientService, ServerService};
use sms_command::registry::CommandService;
use sms_command::{CommandParser, Dispatcher, HttpService, ServiceRegistry, SlashParser};
use sms_proto::Message;
use sms_transport::{CombinedService, MessageSender, MessageService, MessageSubscriber};

use crate::config::{CommandServiceModule, Config, ParserModule, TransportService};
use crate::lifecycle::TaskGroup;

/// Runs the daemon until `cancel` fires or a component fails.
pub async fn run(cfg: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut group = TaskGroup::new(cancel);
    let mut router = Router::new().route("/health", get(|| async { "OK" }));

    // Transports.
    let mut transports: Vec<Arc<dyn MessageService>> = Vec::new();
    for entry in cfg.transport.services {
        match entry {
            TransportService::Wsbridge(client_cfg) => {
                tracing::info!(address = %client_cfg.ws_address, "initializing wsbridge client");
                let client = ClientService::new(client_cfg);
                transports.push(client.clone());

                let token = group.token();
                group.spawn("wsbridge client", async move {
                    client.start(ClientOptions::default(), token).await
                });
            }
            TransportService::WsbridgeServer(entry) => {
                tracing::info!(http_path = %entry.http_path, "initializing wsbridge server");
                let server = ServerService::open(entry.service)
                    .await
                    .context("could not create wsbridge server")?;
                router = router.nest(&entry.http_path, server.router());
                transports.push(server.clone());

                let token = group.token();
                group.spawn("wsbridge server", async move { server.start(token).await });
            }
        }
    }
    let sms = Arc::new(CombinedService::new(transports));

    // Command services.
    let registry = Arc::new(ServiceRegistry::new());
    for module in cfg.command.services {
        match module {
            CommandServiceModule::Http { name, url } => {
                tracing::info!(service = %name, %url, "initializing http command service");
                let service = HttpService::new(name, url);
                registry.register(service.clone());

                let token = group.token();
                let starter = service.clone();
                group.spawn("http command service", async move { starter.start(token).await });

                // Messages the service emits go back out through the
                // aggregated transport.
                let token = group.token();
                let emitter = service as Arc<dyn CommandService>;
                let out = sms.clone();
                group.spawn("command service emitter", async move {
                    emission_loop(emitter, out, token).await
                });
            }
        }
    }

    // Parsers and the dispatcher.
    let parsers: Vec<Arc<dyn CommandParser>> = cfg
        .command
        .parsers
        .iter()
        .map(|module| match module {
            ParserModule::Slash => Arc::new(SlashParser::new()) as Arc<dyn CommandParser>,
        })
        .collect();
    if !parsers.is_empty() {
        let dispatcher = Dispatcher::new(sms.clone(), parsers, registry, None);
        let token = group.token();
        group.spawn("dispatcher", async move { dispatcher.start(token).await });
    }

    // The HTTP server carries the health endpoint and every mounted bridge
    // server route.
    let listen_addr = normalize_listen_addr(&cfg.listen_addr);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("could not listen on {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "starting HTTP server");
    let token = group.token();
    group.spawn("http server", async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
            .context("HTTP server failed")
    });

    group.run().await
}

async fn emission_loop(
    service: Arc<dyn CommandService>,
    sms: Arc<CombinedService>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<Message>(16);
    service
        .subscribe_messages(tx.clone(), None)
        .context("could not subscribe to service messages")?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(err) = sms.send_message(msg).await {
                        tracing::warn!(%err, service = service.name(), "could not forward service message");
                    }
                }
                None => break,
            },
        }
    }

    service.unsubscribe_messages(&tx);
    Ok(())
}

/// Accepts Go-style `:8080` listen addresses by binding all interfaces.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_port_addresses() {
        assert_eq!(normalize_listen_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_listen_addr("127.0.0.1:9090"), "127.0.0.1:9090");
    }
}
