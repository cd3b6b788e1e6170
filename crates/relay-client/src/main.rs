//! # relay-client
//!
//! Manual test harness: connects to a relay, identifies itself, reports a
//! synthetic window every few seconds, pings periodically, and prints every
//! envelope it receives. Ctrl-C closes the connection normally.

#![deny(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{info, warn};

use relay_server::logging::{self, LogFormat};

/// Relay test client.
#[derive(Parser, Debug)]
#[command(name = "relay-client", about = "Relay test client")]
struct Cli {
    /// Relay endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:8080/cli/ws")]
    url: String,

    /// Name sent in the `identification` message.
    #[arg(long, default_value = "TestClient")]
    name: String,

    /// Broadcast this text once after connecting.
    #[arg(long)]
    broadcast: Option<String>,

    /// Seconds between `window_info` reports.
    #[arg(long, default_value_t = 5)]
    window_interval: u64,

    /// Seconds between pings.
    #[arg(long, default_value_t = 15)]
    ping_interval: u64,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn identification(name: &str) -> Value {
    json!({
        "type": "identification",
        "clientName": name,
        "clientType": "relay-client",
        "timestamp": now(),
    })
}

fn window_info(seq: u64) -> Value {
    json!({
        "type": "window_info",
        "windowTitle": format!("relay-client window {seq}"),
        "processName": "relay-client",
        "timestamp": now(),
    })
}

fn ping() -> Value {
    json!({ "type": "ping", "timestamp": now() })
}

fn broadcast(text: &str) -> Value {
    json!({ "type": "broadcast", "message": text, "timestamp": now() })
}

/// One-line summary of a received envelope.
fn describe(raw: &str) -> String {
    let Ok(msg) = serde_json::from_str::<Value>(raw) else {
        return format!("raw: {raw}");
    };
    let field = |k: &str| msg.get(k).and_then(Value::as_str).unwrap_or("").to_owned();
    match field("type").as_str() {
        "welcome" => format!("welcome as {}", field("clientId")),
        "pong" => format!("pong (sent at {})", field("originalTimestamp")),
        "server_ping" => "server ping".to_owned(),
        "broadcast" => format!("broadcast from {}: {}", field("from"), field("message")),
        "echo" => format!("echo: {}", msg.get("originalMessage").unwrap_or(&Value::Null)),
        "error" => format!("error: {} ({})", field("message"), field("error")),
        other => format!("{other}: {raw}"),
    }
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    interval_at(Instant::now() + period, period)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_subscriber(&cli.log_level, LogFormat::Compact);

    let (ws, _) = connect_async(&cli.url)
        .await
        .with_context(|| format!("failed to connect to {}", cli.url))?;
    info!(url = %cli.url, "connected");
    let (mut tx, mut rx) = ws.split();

    tx.send(Message::text(identification(&cli.name).to_string()))
        .await
        .context("failed to send identification")?;
    if let Some(text) = &cli.broadcast {
        tx.send(Message::text(broadcast(text).to_string()))
            .await
            .context("failed to send broadcast")?;
    }

    let mut window_tick = ticker(cli.window_interval);
    let mut ping_tick = ticker(cli.ping_interval);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = window_tick.tick() => {
                seq += 1;
                tx.send(Message::text(window_info(seq).to_string())).await?;
            }
            _ = ping_tick.tick() => {
                tx.send(Message::text(ping().to_string())).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("closing");
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client exiting".into(),
                };
                if let Err(e) = tx.send(Message::Close(Some(frame))).await {
                    warn!(error = %e, "close frame not sent");
                }
                break;
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => info!("{}", describe(text.as_str())),
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "server closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "connection error");
                    break;
                }
                None => break,
            },
        }
    }
    Ok(())
}
