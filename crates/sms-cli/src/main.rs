use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sms_bridge::{ClientConfig, ClientOptions, ClientService};
use sms_proto::Message;
use sms_transport::{MessageSender, MessageSubscriber};

/// How long `send` waits for the bridge connection to come up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "sms-cli", version, about = "talk to an smsd WebSocket bridge")]
struct Args {
    /// URL of the bridge WebSocket endpoint.
    #[arg(short = 'u', long, default_value = "ws://localhost:8080/sms/ws")]
    url: String,

    /// Verbosity level: warn (0), info, debug.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbosity: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a single message and wait for its acknowledgement.
    Send {
        /// The phone number to send from.
        from: String,
        /// The phone number to send to.
        to: String,
        /// The message text.
        message: Vec<String>,
        /// Acknowledgement wait; 0 sends without waiting.
        #[arg(long, default_value_t = 5)]
        ack_timeout_secs: u64,
    },
    /// Subscribe phone numbers and print every incoming message.
    Watch {
        /// The phone numbers to receive for.
        #[arg(required = true)]
        numbers: Vec<String>,
        /// Also replay messages from the last N seconds.
        #[arg(long)]
        since_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbosity);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Send {
            from,
            to,
            message,
            ack_timeout_secs,
        } => send(args.url, from, to, message.join(" "), ack_timeout_secs).await,
        Command::Watch { numbers, since_secs } => watch(args.url, numbers, since_secs).await,
    }
}

async fn send(
    url: String,
    from: String,
    to: String,
    text: String,
    ack_timeout_secs: u64,
) -> anyhow::Result<()> {
    let client = ClientService::new(ClientConfig {
        phone_numbers: vec![from.clone()],
        ws_address: url,
        headers: Default::default(),
        acknowledgement_timeout_secs: ack_timeout_secs,
    });

    let cancel = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.start(ClientOptions::default(), cancel).await })
    };

    wait_connected(&client).await?;
    client
        .send_message(Message::text(from, to, text))
        .await
        .context("could not send message")?;
    println!("message sent");

    cancel.cancel();
    runner.await??;
    Ok(())
}

async fn watch(url: String, numbers: Vec<String>, since_secs: Option<u64>) -> anyhow::Result<()> {
    let client = ClientService::new(ClientConfig {
        phone_numbers: numbers.clone(),
        ws_address: url,
        headers: Default::default(),
        acknowledgement_timeout_secs: 5,
    });

    let (tx, mut rx) = mpsc::channel::<Message>(64);
    client.subscribe_messages(tx.clone(), None)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let opts = ClientOptions {
        last_seen: since_secs.map(|secs| Utc::now() - chrono::Duration::seconds(secs as i64)),
    };
    let runner = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.start(opts, cancel).await })
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if !numbers.contains(&msg.to) {
                        tracing::debug!(from = %msg.from, to = %msg.to, "dropping message not addressed to us");
                        continue;
                    }
                    let when = msg
                        .timestamp
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "[{when}] {} -> {}: {}",
                        msg.from,
                        msg.to,
                        msg.body.as_text().unwrap_or("<non-text body>"),
                    );
                }
                None => break,
            },
        }
    }

    client.unsubscribe_messages(&tx);
    runner.await??;
    Ok(())
}

async fn wait_connected(client: &ClientService) -> anyhow::Result<()> {
    let mut connected = client.connected_watch();
    tokio::time::timeout(CONNECT_TIMEOUT, async {
        while !*connected.borrow_and_update() {
            connected.changed().await?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("timed out connecting to the bridge server")??;
    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .with_writer(std::io::stderr)
        .init();
}
