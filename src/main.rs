//! CLI for fanout
//!
//! Subcommands:
//! - `serve`: run the broadcast service
//! - `listen`: join topics on a running server and print every frame (useful
//!   for smoke tests)

use anyhow::Context;
use clap::{Parser, Subcommand};
use fanout::Service;
use fanout::config::{DEFAULT_CONFIG_PATH, load_config_from};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fanout", version, about = "Topic broadcast over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broadcast service
    Serve {
        /// Configuration file, extension optional
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Join topics and print every frame received
    Listen {
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            fanout::utils::logging::init(&log_level);
            run_server(&config).await
        }
        Command::Listen { url, topics } => {
            fanout::utils::logging::init("warn");
            run_listener(&url, topics).await
        }
    }
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let settings = load_config_from(config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    info!(addr = %settings.server.addr(), path = %settings.broadcast.path, "starting");

    let service = Service::new(settings);

    tokio::select! {
        result = service.serve() => {
            if let Err(e) = &result {
                error!(error = %e, "service failed");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    service.stop().await;
    Ok(())
}

async fn run_listener(url: &str, topics: Vec<String>) -> anyhow::Result<()> {
    let (mut ws, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let join = serde_json::json!({ "cmd": "join", "args": topics });
    ws.send(WsMessage::text(join.to_string())).await?;

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => println!("{text}"),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = ws.close(None).await;
                break;
            }
        }
    }
    Ok(())
}
