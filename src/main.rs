//! Sitewatch - Endpoint Health Monitoring

use sitewatch::config::{ServerConfig, SitesFile};
use sitewatch::db::Store;
use sitewatch::probe::Checkers;
use sitewatch::scheduler::SchedulerEvent;
use sitewatch::service::Monitoring;

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("sitewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Sitewatch...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::open(&cfg.db_path, cfg.history_config())?);
    tracing::info!("Database initialized successfully");

    let monitoring = Monitoring::new(store, Checkers::standard()?, cfg.retry_policy());

    if let Some(path) = &cfg.monitors_path {
        let sites = SitesFile::load(path)?;
        let added = monitoring.load_sites(&sites)?;
        tracing::info!("Loaded {} sites from {} ({} new monitors)", sites.sites.len(), path.display(), added);
    }

    let mut events = monitoring.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::CycleCompleted { monitor_id, result }) => {
                    tracing::debug!(
                        "Monitor {}: {} in {}ms",
                        monitor_id,
                        result.status.as_str(),
                        result.response_time_ms
                    );
                }
                Ok(SchedulerEvent::HistoryPruned { monitor_id, removed_count }) => {
                    tracing::debug!("Monitor {}: pruned {} history entries", monitor_id, removed_count);
                }
                Ok(SchedulerEvent::ResultUndelivered { monitor_id, error, .. }) => {
                    tracing::error!("Monitor {}: result lost: {}", monitor_id, error);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger fell behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Start scheduler
    let count = monitoring.start().await?;
    if count == 0 {
        tracing::warn!("No monitors configured; set SITEWATCH_MONITORS_PATH to load some");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    monitoring.shutdown().await;

    Ok(())
}
