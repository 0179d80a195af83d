//! Configuration for the depth synchronization service

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Trading symbol to track (e.g. "BTCUSDT")
    pub symbol: String,

    /// WebSocket endpoint for the combined depth stream
    pub ws_endpoint: String,

    /// REST API endpoint for book snapshots
    pub rest_endpoint: String,

    /// Depth limit requested for the snapshot
    pub snapshot_depth: u32,

    /// Price quantization unit; `None` keeps raw prices
    pub granularity: Option<Decimal>,

    /// Capacity of the diff-batch channel between listener and engine
    pub batch_channel_capacity: usize,

    /// Bind address for the metrics/health server
    pub metrics_addr: String,

    /// Products the candle collector polls (e.g. ["btc-usd", "eth-usd"])
    pub candle_products: Vec<String>,

    /// REST API endpoint for historical candles
    pub candle_endpoint: String,

    /// Candle width and poll interval in seconds
    pub candle_granularity_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let granularity = match env::var("BOOK_GRANULARITY") {
            Ok(raw) => {
                let g = Decimal::from_str(raw.trim()).map_err(|e| {
                    Error::Config(format!("invalid BOOK_GRANULARITY '{raw}': {e}"))
                })?;
                if g <= Decimal::ZERO {
                    return Err(Error::Config(format!(
                        "BOOK_GRANULARITY must be positive, got {g}"
                    )));
                }
                Some(g)
            }
            Err(_) => None,
        };

        let candle_products: Vec<String> = env::var("CANDLE_PRODUCTS")
            .unwrap_or_else(|_| "btc-usd".to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            symbol: env::var("SYMBOL")
                .unwrap_or_else(|_| "BTCUSDT".to_string())
                .to_uppercase(),
            ws_endpoint: env::var("WS_ENDPOINT")
                .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string()),
            rest_endpoint: env::var("REST_ENDPOINT")
                .unwrap_or_else(|_| "https://api.binance.com/api/v3".to_string()),
            snapshot_depth: parse_env("SNAPSHOT_DEPTH", 5000)?,
            granularity,
            batch_channel_capacity: parse_env("BATCH_CHANNEL_CAPACITY", 64)?,
            metrics_addr: env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
            candle_products,
            candle_endpoint: env::var("CANDLE_ENDPOINT")
                .unwrap_or_else(|_| "https://api.exchange.coinbase.com".to_string()),
            candle_granularity_secs: parse_env("CANDLE_GRANULARITY_SECS", 60)?,
        })
    }

    /// Stream name for the symbol's differential depth channel
    pub fn depth_stream(&self) -> String {
        format!("{}@depth@100ms", self.symbol.to_lowercase())
    }
}

/// Parse an optional environment variable; set-but-malformed is an error
fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {key} '{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            snapshot_depth: 5000,
            granularity: None,
            batch_channel_capacity: 64,
            metrics_addr: "0.0.0.0:9090".to_string(),
            candle_products: vec!["btc-usd".to_string()],
            candle_endpoint: "https://api.exchange.coinbase.com".to_string(),
            candle_granularity_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_defaults_when_unset() {
        assert_eq!(parse_env("DEPTHSYNC_TEST_UNSET", 64usize).unwrap(), 64);
    }

    #[test]
    fn test_parse_env_rejects_malformed_value() {
        env::set_var("DEPTHSYNC_TEST_MALFORMED", "not-a-number");
        let result: Result<u32> = parse_env("DEPTHSYNC_TEST_MALFORMED", 5000);
        env::remove_var("DEPTHSYNC_TEST_MALFORMED");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_env_accepts_padded_value() {
        env::set_var("DEPTHSYNC_TEST_PADDED", " 128 ");
        let result: Result<u32> = parse_env("DEPTHSYNC_TEST_PADDED", 5000);
        env::remove_var("DEPTHSYNC_TEST_PADDED");
        assert_eq!(result.unwrap(), 128);
    }

    #[test]
    fn test_depth_stream_name() {
        assert_eq!(Config::default().depth_stream(), "btcusdt@depth@100ms");
    }
}
