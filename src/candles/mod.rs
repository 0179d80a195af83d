//! Historical candle collection
//!
//! A poll-and-insert job: every candle interval it fetches recent OHLCV
//! candles for each configured product, resuming from the latest stored
//! timestamp, and hands them to a [`CandleStore`]. Persistence itself lives
//! behind the store trait; an in-memory implementation backs the default
//! wiring and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::service::Service;

const EXCHANGE: &str = "coinbase";

/// Timestamp of the oldest candle we care about (2020-01-01 00:00:00 UTC)
const MIN_TIMESTAMP: i64 = 1_577_836_800;

/// Maximum number of candles in a single request
const MAX_PAYLOAD: i64 = 300;

/// One OHLCV candle
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub pair: String,
    pub start: DateTime<Utc>,
    pub price_low: f64,
    pub price_high: f64,
    pub price_open: f64,
    pub price_close: f64,
    pub volume: f64,
}

/// Persistence boundary for collected candles
pub trait CandleStore: Send + Sync {
    fn insert_candles(&self, candles: &[Candle]) -> Result<()>;

    /// Start time of the most recent stored candle for a pair
    fn latest_candle(&self, pair: &str) -> Result<Option<DateTime<Utc>>>;
}

/// In-memory store keyed by pair and candle start time
#[derive(Default)]
pub struct MemoryCandleStore {
    inner: Mutex<HashMap<String, BTreeMap<i64, Candle>>>,
}

impl CandleStore for MemoryCandleStore {
    fn insert_candles(&self, candles: &[Candle]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Candles("store lock poisoned".to_string()))?;
        for candle in candles {
            inner
                .entry(candle.pair.clone())
                .or_default()
                .insert(candle.start.timestamp(), candle.clone());
        }
        Ok(())
    }

    fn latest_candle(&self, pair: &str) -> Result<Option<DateTime<Utc>>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Candles("store lock poisoned".to_string()))?;
        Ok(inner
            .get(pair)
            .and_then(|candles| candles.last_key_value())
            .and_then(|(ts, _)| Utc.timestamp_opt(*ts, 0).single()))
    }
}

/// Periodic candle collection job
pub struct CandleCollector {
    config: Config,
    client: Mutex<Option<reqwest::Client>>,
    store: Arc<dyn CandleStore>,
    metrics: Arc<Metrics>,
}

impl CandleCollector {
    pub fn new(config: Config, store: Arc<dyn CandleStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            store,
            metrics,
        }
    }

    // reqwest clients are cheap handles around a shared pool.
    fn client(&self) -> Result<reqwest::Client> {
        self.client
            .lock()
            .map_err(|_| Error::Candles("client lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| Error::Candles("collector not initialised".to_string()))
    }

    /// Collect candles for a pair from the latest stored timestamp up to now
    async fn collect_recent(&self, pair: &str, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let granularity = self.config.candle_granularity_secs as i64;
        let mut start = self.start_timestamp(pair, granularity).await?;

        let mut now = Utc::now().timestamp();
        now -= now % granularity;

        while start <= now {
            if *shutdown.borrow() {
                return Ok(());
            }

            let candles = self.download_candles(pair, start, granularity).await?;
            self.store.insert_candles(&candles)?;

            if let Some(max_ts) = candles.iter().map(|c| c.start.timestamp()).max() {
                self.metrics
                    .latest_candle_collected
                    .with_label_values(&[EXCHANGE, pair])
                    .set(max_ts as f64);
                debug!(pair, count = candles.len(), latest = max_ts, "Candles stored");
            }

            start += granularity * MAX_PAYLOAD;
        }

        Ok(())
    }

    /// Resume point: one step past the latest stored candle, or the first
    /// timestamp the exchange has data for
    async fn start_timestamp(&self, pair: &str, granularity: i64) -> Result<i64> {
        if let Some(latest) = self.store.latest_candle(pair)? {
            return Ok(latest.timestamp() + granularity);
        }

        // Nothing stored yet: probe forward in day-wide windows until the
        // exchange returns data, then begin at its earliest candle.
        const GRAN_DAY: i64 = 24 * 60 * 60;
        let mut today = Utc::now().timestamp();
        today -= today % GRAN_DAY;

        let mut start = MIN_TIMESTAMP;
        while start <= today {
            let candles = self.download_candles(pair, start, GRAN_DAY).await?;
            if let Some(min_ts) = candles.iter().map(|c| c.start.timestamp()).min() {
                return Ok(min_ts);
            }
            start += GRAN_DAY * MAX_PAYLOAD;
        }

        Ok(today)
    }

    async fn download_candles(
        &self,
        pair: &str,
        start: i64,
        granularity: i64,
    ) -> Result<Vec<Candle>> {
        let (start, end) = request_window(start, granularity);

        let url = format!(
            "{}/products/{}/candles?granularity={}&start={}&end={}",
            self.config.candle_endpoint, pair, granularity, start, end
        );

        self.metrics
            .latest_candle_queried
            .with_label_values(&[EXCHANGE, pair])
            .set(end as f64);

        let response = self
            .client()?
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Candles(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Candles(format!("unexpected status: {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Candles(format!("failed to read response: {e}")))?;

        parse_candles(pair, &body)
    }
}

/// Normalise a window start and compute its inclusive end
fn request_window(start: i64, granularity: i64) -> (i64, i64) {
    let start = start - start % granularity;
    (start, start + granularity * (MAX_PAYLOAD - 1))
}

/// Parse the `[[time, low, high, open, close, volume], ...]` response body
fn parse_candles(pair: &str, body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<(i64, f64, f64, f64, f64, f64)> =
        serde_json::from_str(body).map_err(|e| Error::Candles(format!("bad response: {e}")))?;

    rows.into_iter()
        .map(|(ts, low, high, open, close, volume)| {
            let start = Utc
                .timestamp_opt(ts, 0)
                .single()
                .ok_or_else(|| Error::Candles(format!("invalid candle timestamp: {ts}")))?;
            Ok(Candle {
                pair: pair.to_string(),
                start,
                price_low: low,
                price_high: high,
                price_open: open,
                price_close: close,
                volume,
            })
        })
        .collect()
}

#[async_trait]
impl Service for CandleCollector {
    fn name(&self) -> &str {
        "Candle Collector"
    }

    async fn init(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Candles(format!("failed to build client: {e}")))?;
        *self
            .client
            .lock()
            .map_err(|_| Error::Candles("client lock poisoned".to_string()))? = Some(client);
        Ok(())
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let period = Duration::from_secs(self.config.candle_granularity_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => {
                    for pair in self.config.candle_products.clone() {
                        if let Err(e) = self.collect_recent(&pair, &shutdown).await {
                            // A failed pair does not stop the collector.
                            error!(pair = %pair, error = %e, "Candle collection failed");
                        }
                    }
                }
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(pair: &str, ts: i64) -> Candle {
        Candle {
            pair: pair.to_string(),
            start: Utc.timestamp_opt(ts, 0).single().unwrap(),
            price_low: 1.0,
            price_high: 2.0,
            price_open: 1.5,
            price_close: 1.8,
            volume: 10.0,
        }
    }

    #[test]
    fn test_memory_store_latest_candle() {
        let store = MemoryCandleStore::default();
        assert_eq!(store.latest_candle("btc-usd").unwrap(), None);

        store
            .insert_candles(&[candle("btc-usd", 120), candle("btc-usd", 60)])
            .unwrap();

        let latest = store.latest_candle("btc-usd").unwrap().unwrap();
        assert_eq!(latest.timestamp(), 120);
        assert_eq!(store.latest_candle("eth-usd").unwrap(), None);
    }

    #[test]
    fn test_insert_is_idempotent_per_start_time() {
        let store = MemoryCandleStore::default();
        store.insert_candles(&[candle("btc-usd", 60)]).unwrap();
        store.insert_candles(&[candle("btc-usd", 60)]).unwrap();

        let inner = store.inner.lock().unwrap();
        assert_eq!(inner.get("btc-usd").unwrap().len(), 1);
    }

    #[test]
    fn test_request_window_alignment() {
        let (start, end) = request_window(125, 60);
        assert_eq!(start, 120);
        assert_eq!(end, 120 + 60 * (MAX_PAYLOAD - 1));
    }

    #[test]
    fn test_parse_candles() {
        let body = "[[1577836800, 7160.0, 7170.5, 7165.1, 7162.3, 12.5], \
                     [1577836860, 7161.0, 7175.0, 7162.3, 7174.8, 8.25]]";

        let candles = parse_candles("btc-usd", body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].start.timestamp(), 1_577_836_800);
        assert_eq!(candles[0].price_low, 7160.0);
        assert_eq!(candles[1].price_close, 7174.8);
        assert_eq!(candles[1].pair, "btc-usd");
    }

    #[test]
    fn test_parse_candles_rejects_malformed_body() {
        assert!(parse_candles("btc-usd", "{\"not\": \"an array\"}").is_err());
    }

    #[test]
    fn test_parse_candles_empty_body() {
        assert!(parse_candles("btc-usd", "[]").unwrap().is_empty());
    }
}
