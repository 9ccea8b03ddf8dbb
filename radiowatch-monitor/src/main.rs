//! radiowatch-monitor - Radio airplay detection service
//!
//! Polls every active station on a fixed interval, identifies what is
//! playing, and maintains play sessions and aggregate statistics. Runs
//! until SIGINT.

use anyhow::Result;
use radiowatch_common::events::EventBus;
use radiowatch_monitor::{MonitorConfig, StationOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("radiowatch_monitor=info,radiowatch_common=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting radiowatch-monitor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = MonitorConfig::load()?;
    info!("Database: {}", config.database_path.display());

    let db_pool = radiowatch_monitor::db::init_database_pool(&config.database_path).await?;
    info!("Database connection established");

    let event_bus = EventBus::new(config.event_capacity);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    let orchestrator = StationOrchestrator::new(db_pool, config, event_bus, cancel)?;
    orchestrator.run().await?;

    Ok(())
}
