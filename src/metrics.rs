//! Prometheus metrics and the export server
//!
//! The [`Metrics`] handle is injected into the components that record
//! observations; the [`MetricsServer`] service exposes them over HTTP
//! together with a health endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};
use crate::service::Service;

const NAMESPACE: &str = "depthsync";

/// Counters and gauges shared across services
pub struct Metrics {
    registry: Registry,

    /// Updates applied to the order book since it was first completed
    pub book_updates: IntCounterVec,

    /// Unix timestamp of the latest candle collected per exchange/pair
    pub latest_candle_collected: GaugeVec,

    /// Unix timestamp of the latest candle queried (not necessarily collected)
    pub latest_candle_queried: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let book_updates = IntCounterVec::new(
            Opts::new(
                "order_book_updates_total",
                "The total number of updates the specified order book received since it was first completed.",
            )
            .namespace(NAMESPACE),
            &["exchange", "pair"],
        )?;

        let latest_candle_collected = GaugeVec::new(
            Opts::new(
                "latest_candle_collected_timestamp_seconds",
                "The Unix timestamp of the latest candle collected for the specified trading pair.",
            )
            .namespace(NAMESPACE),
            &["exchange", "pair"],
        )?;

        let latest_candle_queried = GaugeVec::new(
            Opts::new(
                "latest_candle_queried_timestamp_seconds",
                "The Unix timestamp of the latest candle queried (but not necessarily collected) for the specified trading pair.",
            )
            .namespace(NAMESPACE),
            &["exchange", "pair"],
        )?;

        registry.register(Box::new(book_updates.clone()))?;
        registry.register(Box::new(latest_candle_collected.clone()))?;
        registry.register(Box::new(latest_candle_queried.clone()))?;

        Ok(Arc::new(Self {
            registry,
            book_updates,
            latest_candle_collected,
            latest_candle_queried,
        }))
    }

    /// Encode all registered metrics in the Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(e.to_string()))
    }
}

/// HTTP server for health checks and metrics export
pub struct MetricsServer {
    addr: String,
    metrics: Arc<Metrics>,
}

impl MetricsServer {
    pub fn new(addr: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            addr: addr.to_string(),
            metrics,
        }
    }
}

#[async_trait]
impl Service for MetricsServer {
    fn name(&self) -> &str {
        "Metrics Server"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = Router::new()
            .route("/health", get(health))
            .route("/metrics", get(export))
            .with_state(self.metrics.clone());

        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| Error::Metrics(format!("failed to bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, "Metrics server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::Metrics(e.to_string()))
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "depthsync",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn export(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.gather().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_metrics_appear_in_export() {
        let metrics = Metrics::new().unwrap();
        metrics
            .book_updates
            .with_label_values(&["binance", "BTCUSDT"])
            .inc();
        metrics
            .latest_candle_collected
            .with_label_values(&["coinbase", "btc-usd"])
            .set(1_700_000_000.0);

        let text = metrics.gather().unwrap();
        assert!(text.contains("depthsync_order_book_updates_total"));
        assert!(text.contains("depthsync_latest_candle_collected_timestamp_seconds"));
    }
}
