//! Wire types for the exchange depth feed
//!
//! Covers the combined-stream envelope, differential depth batches, the REST
//! snapshot, and the subscription frame sent after connecting.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

use crate::book::Level;

/// One differential depth batch from the push feed
#[derive(Debug, Clone, Deserialize)]
pub struct DiffBatch {
    /// Event time (milliseconds)
    #[serde(rename = "E", default)]
    pub event_time: u64,

    /// First update ID covered by this batch
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID covered by this batch
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Ask changes
    #[serde(rename = "a", deserialize_with = "deserialize_levels", default)]
    pub asks: Vec<Level>,

    /// Bid changes
    #[serde(rename = "b", deserialize_with = "deserialize_levels", default)]
    pub bids: Vec<Level>,
}

/// Combined-stream envelope; messages without `data` carry no batch
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub stream: Option<String>,

    #[serde(default)]
    pub data: Option<DiffBatch>,
}

/// Full book snapshot from the REST API
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_levels")]
    pub asks: Vec<Level>,

    #[serde(deserialize_with = "deserialize_levels")]
    pub bids: Vec<Level>,
}

/// Subscription request sent once after connecting
#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    pub method: &'static str,
    pub id: u64,
    pub params: Vec<String>,
}

impl SubscribeRequest {
    pub fn new(id: u64, channel: &str) -> Self {
        Self {
            method: "SUBSCRIBE",
            id,
            params: vec![channel.to_string()],
        }
    }
}

/// Deserialize `[["price", "amount"], ...]` string pairs into levels
fn deserialize_levels<'de, D>(deserializer: D) -> Result<Vec<Level>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("invalid price level format"));
            }
            Ok(Level {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                amount: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_diff_batch_envelope() {
        let raw = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate",
                "E": 1672531200000,
                "s": "BTCUSDT",
                "U": 100,
                "u": 105,
                "b": [["50000.00", "1.5"], ["49999.00", "2.0"]],
                "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
            }
        }"#;

        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        let batch = msg.data.expect("envelope should carry a batch");
        assert_eq!(batch.first_update_id, 100);
        assert_eq!(batch.final_update_id, 105);
        assert_eq!(batch.bids.len(), 2);
        assert_eq!(batch.asks.len(), 2);
        assert_eq!(batch.bids[0].price, dec!(50000.00));
        assert_eq!(batch.asks[1].amount, dec!(0.5));
    }

    #[test]
    fn test_envelope_without_data_is_empty() {
        let raw = r#"{"result": null, "id": 1}"#;
        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.data.is_none());
    }

    #[test]
    fn test_parse_snapshot() {
        let raw = r#"{
            "lastUpdateId": 160,
            "bids": [["50000.00", "1.5"]],
            "asks": [["50001.00", "1.0"]]
        }"#;

        let snap: Snapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snap.last_update_id, 160);
        assert_eq!(snap.bids[0].amount, dec!(1.5));
        assert_eq!(snap.asks[0].price, dec!(50001.00));
    }

    #[test]
    fn test_malformed_level_is_an_error() {
        let raw = r#"{"lastUpdateId": 1, "bids": [["50000.00"]], "asks": []}"#;
        assert!(serde_json::from_str::<Snapshot>(raw).is_err());
    }

    #[test]
    fn test_subscribe_request_shape() {
        let req = SubscribeRequest::new(3, "btcusdt@depth@100ms");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "method": "SUBSCRIBE",
                "id": 3,
                "params": ["btcusdt@depth@100ms"]
            })
        );
    }
}
