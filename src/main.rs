use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use tg_relay::channels::{TelegramConfig, TelegramTransport};
use tg_relay::config::RelayConfig;
use tg_relay::health;
use tg_relay::logging::init_logging;
use tg_relay::pipeline::Relay;
use tg_relay::shutdown::os_signals;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_dir = std::env::var("RELAY_LOG_DIR").ok().map(PathBuf::from);
    let _log_guard = init_logging(log_dir.as_deref()).context("failed to set up logging")?;

    let config = RelayConfig::from_env().context("failed to load relay configuration")?;
    let telegram = TelegramConfig::from_env().context("failed to read Telegram settings")?;

    eprintln!("📡 tg-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Sources: {}", config.sources.len());
    eprintln!("   Destination: {}", config.destination);
    if let Some(port) = config.health_port {
        eprintln!("   Health: http://0.0.0.0:{port}/health");
    }

    let transport = Arc::new(TelegramTransport::new(telegram)?);
    let health_port = config.health_port;
    let handle = Relay::start(config, transport);

    // ── Health server ────────────────────────────────────────────────────
    if let Some(port) = health_port {
        let stats = handle.stats();
        let shutdown = handle.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, stats, shutdown).await {
                tracing::error!(port, error = %e, "Health server failed");
            }
        });
    }

    let signal = os_signals()
        .context("failed to install signal handlers")?
        .await;
    tracing::info!(signal, "Shutting down");

    let report = handle.shutdown().await;
    tracing::info!(
        received = report.stats.received,
        forwarded = report.stats.forwarded,
        duplicates = report.stats.duplicates,
        filtered_out = report.stats.filtered_out,
        failed = report.stats.failed,
        aborted_workers = report.aborted,
        "Final relay statistics"
    );

    Ok(())
}

