//! Snapshot fetcher for the full order book
//!
//! Driven by a capacity-1 request signal: a request while one is already
//! pending coalesces into it, so at most one fetch is meaningfully in flight.
//! Every accepted signal produces exactly one snapshot or one typed error; no
//! retries happen here.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::messages::Snapshot;
use crate::error::{Error, Result};

/// Bound on a single snapshot request
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for signalling that a fresh snapshot is wanted
#[derive(Clone)]
pub struct SnapshotRequester(mpsc::Sender<()>);

impl SnapshotRequester {
    /// Request a fetch; a duplicate of a pending request is a no-op
    pub fn request(&self) {
        let _ = self.0.try_send(());
    }
}

/// Create the coalescing request signal pair
pub fn request_channel() -> (SnapshotRequester, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (SnapshotRequester(tx), rx)
}

/// Fetcher performing one bounded-timeout REST request per accepted signal
pub struct SnapshotFetcher {
    client: reqwest::Client,
    url: String,
}

impl SnapshotFetcher {
    pub fn new(rest_endpoint: &str, symbol: &str, depth: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::SnapshotFetch(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{rest_endpoint}/depth?symbol={symbol}&limit={depth}"),
        })
    }

    /// Serve fetch signals until shutdown or until either channel closes
    pub async fn run(
        &self,
        mut signal_rx: mpsc::Receiver<()>,
        result_tx: mpsc::Sender<Result<Snapshot>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                signal = signal_rx.recv() => {
                    if signal.is_none() {
                        return Ok(());
                    }

                    debug!(url = %self.url, "Fetching order book snapshot");
                    let result = self.fetch().await;
                    if let Ok(snapshot) = &result {
                        info!(last_update_id = snapshot.last_update_id, "Snapshot fetched");
                    }
                    if result_tx.send(result).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn fetch(&self) -> Result<Snapshot> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SnapshotFetch(format!("unexpected status: {status}")));
        }

        Ok(response.json::<Snapshot>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_requests_coalesce() {
        let (requester, mut rx) = request_channel();

        requester.request();
        requester.request();
        requester.request();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
