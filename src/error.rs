//! Error types for the depth synchronization service

use thiserror::Error;

/// Depth synchronization errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to establish feed connection: {0}")]
    Connection(String),

    #[error("feed stream read failed: {0}")]
    StreamRead(String),

    #[error("failed to decode feed payload: {0}")]
    Decode(String),

    #[error("snapshot fetch failed: {0}")]
    SnapshotFetch(String),

    #[error("update continuity gap: expected first update id {expected}, got {got}")]
    ContinuityGap { expected: u64, got: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("candle collection failed: {0}")]
    Candles(String),

    #[error("service channel closed unexpectedly: {0}")]
    ChannelClosed(&'static str),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::StreamRead(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::SnapshotFetch(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
