//! # relay-daemon
//!
//! `relayd`: loads settings, starts the `WebSocket` relay, and shuts it down
//! gracefully on SIGINT or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::config::{self, ServerConfig};
use relay_server::logging::{self, LogFormat};
use relay_server::server::RelayServer;
use tracing::{info, warn};

/// `WebSocket` message relay.
#[derive(Parser, Debug)]
#[command(name = "relayd", about = "WebSocket message relay", version)]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// `WebSocket` endpoint path (overrides settings).
    #[arg(long)]
    path: Option<String>,

    /// Seconds between keepalive probes (overrides settings).
    #[arg(long)]
    keepalive_interval: Option<u64>,

    /// Settings file (default `~/.relay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: `compact` or `json`.
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Do not install the Prometheus recorder.
    #[arg(long)]
    no_metrics: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded settings.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.path {
            config.path.clone_from(path);
        }
        if let Some(secs) = self.keepalive_interval {
            config.keepalive_interval_secs = secs;
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                let _ = sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_subscriber(&cli.log_level, cli.log_format);

    let settings = cli.settings.clone().unwrap_or_else(config::settings_path);
    let mut server_config = config::load_config_from_path(&settings)
        .with_context(|| format!("failed to load settings from {}", settings.display()))?;
    cli.apply(&mut server_config);
    server_config.validate().context("invalid configuration")?;

    let mut server = RelayServer::new(server_config);
    if !cli.no_metrics {
        let handle = relay_server::metrics::install_recorder()
            .context("failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    server
        .serve_until(shutdown_signal())
        .await
        .context("relay failed")?;

    info!("shutdown complete");
    Ok(())
}
