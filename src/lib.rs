//! depthsync - order book synchronization library
//!
//! Keeps a locally-maintained limit order book in sync with an exchange's
//! differential depth feed, reconciled against REST snapshots, and exposes
//! best-bid/best-ask queries. Side jobs collect historical candles and export
//! metrics; everything runs under a common service supervisor.

pub mod book;
pub mod candles;
pub mod config;
pub mod depth;
pub mod engine;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod service;

pub use book::{Level, OrderBook, Side, TopOfBook};
pub use candles::{Candle, CandleCollector, CandleStore, MemoryCandleStore};
pub use config::Config;
pub use depth::DepthService;
pub use engine::ReconcileEngine;
pub use error::{Error, Result};
pub use feed::{DiffBatch, FeedListener, Snapshot, SnapshotFetcher};
pub use metrics::{Metrics, MetricsServer};
pub use service::{run_services, Service};
