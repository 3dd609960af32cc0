//! # relaymux-agent
//!
//! Relay agent binary: loads settings, initialises logging and metrics,
//! connects to the gateway and relays streams until Ctrl-C.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use relaymux_logging::LogFormat;
use relaymux_relay::{CoordinatorConfig, Relay, RelayConfig, TcpSocketProvider};
use relaymux_settings::RelaySettings;
use relaymux_transport::{TransportConfig, WsConnector};

/// Relay agent.
#[derive(Parser, Debug)]
#[command(name = "relaymux-agent", about = "Multiplexed connection relay agent")]
struct Cli {
    /// Settings file (defaults to `$RELAYMUX_SETTINGS`, then `~/.relaymux/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Gateway WebSocket URL (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Destination identity to announce (overrides settings).
    #[arg(long)]
    identity: Option<String>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format: `json` or `pretty`.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// CLI flags win over file and environment.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(url) = &self.url {
            settings.gateway.url.clone_from(url);
        }
        if let Some(identity) = &self.identity {
            settings.identity = Some(identity.clone());
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn relay_config(settings: &RelaySettings) -> RelayConfig {
    RelayConfig {
        transport: TransportConfig {
            reconnect_backoff: settings.gateway.reconnect_backoff(),
            send_queue_capacity: settings.gateway.send_queue_capacity,
        },
        coordinator: CoordinatorConfig {
            max_chunk_bytes: settings.streams.max_chunk_bytes,
            high_water_mark: settings.streams.high_water_mark_bytes,
            low_water_mark: settings.streams.low_water_mark_bytes,
            drain_timeout: settings.streams.drain_timeout(),
        },
        identity: settings.identity.clone(),
    }
}

fn install_metrics(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {listen_addr}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Settings come first: they carry the log level.
    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(relaymux_settings::settings_path);
    let mut settings = relaymux_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let _ = relaymux_logging::init_subscriber(&settings.logging.level, settings.logging.format);
    tracing::info!(
        path = %settings_path.display(),
        gateway = %settings.gateway.url,
        identity = settings.identity.is_some(),
        "relaymux agent starting"
    );

    if let Some(listen_addr) = &settings.metrics.listen_addr {
        install_metrics(listen_addr)?;
    }

    let connector = Arc::new(WsConnector::new(
        settings.gateway.url.clone(),
        settings.gateway.connect_timeout(),
    ));
    let provider = Arc::new(TcpSocketProvider::new(settings.streams.dial_timeout()));
    let relay = Relay::spawn(connector, provider, relay_config(&settings));

    let mut status = relay.subscribe_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            tracing::info!(
                connected = current.connected,
                active_connections = current.active_connections,
                "relay status changed"
            );
        }
    });

    if let Err(error) = relay.start().await {
        // The session keeps retrying on its own.
        tracing::warn!(%error, "initial gateway connect failed");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    relay.shutdown().await;
    status_task.abort();
    Ok(())
}
