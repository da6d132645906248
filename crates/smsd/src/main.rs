mod app;
mod config;
mod lifecycle;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "smsd", version, about = "pluggable SMS-messaging daemon")]
struct Args {
    /// Path to the TOML configuration file.
    config: PathBuf,

    /// Override the configured HTTP listen address.
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Verbosity level: warn (0), info, debug.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbosity: u8,

    /// Log as JSON to stdout.
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(()) => {
            tracing::info!("smsd shut down");
            ExitCode::SUCCESS
        }
        Err(err) => {
            let chain = format!("{err:#}");
            tracing::error!(err = %chain, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received interrupt, shutting down");
                cancel.cancel();
            }
        });
    }

    app::run(cfg, cancel).await
}

fn init_logging(args: &Args) {
    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_level.into());

    if args.json_log {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(std::env::var_os("NO_COLOR").is_none())
            .init();
    }
}
