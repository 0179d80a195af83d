//! depthsync - order book synchronization service
//!
//! Maintains a live order book from an exchange depth feed, collects
//! historical candles, and exports metrics, all hosted by a common service
//! supervisor.

use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use depthsync::candles::{CandleCollector, MemoryCandleStore};
use depthsync::config::Config;
use depthsync::depth::DepthService;
use depthsync::metrics::{Metrics, MetricsServer};
use depthsync::service::{run_services, Service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting depthsync");

    let config = Config::load()?;
    info!(
        symbol = %config.symbol,
        granularity = ?config.granularity,
        "Configuration loaded"
    );

    let metrics = Metrics::new()?;
    let store = Arc::new(MemoryCandleStore::default());

    let services: Vec<Arc<dyn Service>> = vec![
        Arc::new(MetricsServer::new(&config.metrics_addr, metrics.clone())),
        Arc::new(DepthService::new(config.clone(), metrics.clone())),
        Arc::new(CandleCollector::new(config, store, metrics)),
    ];

    run_services(services).await?;

    Ok(())
}
