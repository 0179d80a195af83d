//! Depth synchronization service
//!
//! Hosts the feed listener, the snapshot fetcher, and the reconciliation
//! engine as one supervised job. The listener and fetcher run on their own
//! tasks behind bounded channels; the engine's event loop is the only book
//! mutator. A fatal error in any task cancels its siblings.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::book::TopOfBook;
use crate::config::Config;
use crate::engine::ReconcileEngine;
use crate::error::{Error, Result};
use crate::feed::{request_channel, FeedListener, SnapshotFetcher};
use crate::metrics::Metrics;
use crate::service::Service;

/// Endpoints the run loop consumes exactly once
struct RunHandles {
    top_tx: watch::Sender<TopOfBook>,
    close_rx: mpsc::Receiver<()>,
}

pub struct DepthService {
    config: Config,
    metrics: Arc<Metrics>,
    handles: Mutex<Option<RunHandles>>,
    top_rx: watch::Receiver<TopOfBook>,
    close_tx: mpsc::Sender<()>,
}

impl DepthService {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Self {
        let (top_tx, top_rx) = watch::channel(TopOfBook::default());
        let (close_tx, close_rx) = mpsc::channel(1);
        Self {
            config,
            metrics,
            handles: Mutex::new(Some(RunHandles { top_tx, close_rx })),
            top_rx,
            close_tx,
        }
    }

    /// Read-only top-of-book view for downstream consumers
    pub fn top_of_book(&self) -> watch::Receiver<TopOfBook> {
        self.top_rx.clone()
    }

    fn take_handles(&self) -> Result<RunHandles> {
        self.handles
            .lock()
            .map_err(|_| Error::Config("depth service state poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::Config("depth service started twice".to_string()))
    }
}

#[async_trait]
impl Service for DepthService {
    fn name(&self) -> &str {
        "Depth Synchronization"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let RunHandles { top_tx, close_rx } = self.take_handles()?;

        let (batch_tx, batch_rx) = mpsc::channel(self.config.batch_channel_capacity);
        let (requester, signal_rx) = request_channel();
        let (result_tx, result_rx) = mpsc::channel(1);

        let mut listener = FeedListener::new(&self.config.ws_endpoint, &self.config.depth_stream());
        listener.connect().await?;

        let fetcher = SnapshotFetcher::new(
            &self.config.rest_endpoint,
            &self.config.symbol,
            self.config.snapshot_depth,
        )?;

        let mut engine = ReconcileEngine::new(
            &self.config.symbol,
            self.config.granularity,
            requester,
            top_tx,
            self.metrics.clone(),
        );

        // Sibling cancellation: when the engine loop ends for any reason the
        // listener and fetcher are told to wind down, and vice versa their
        // channel endpoints closing surfaces in the engine loop.
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let listener_cancel = cancel_rx.clone();
        let listener_task =
            tokio::spawn(async move { listener.run(batch_tx, close_rx, listener_cancel).await });
        let fetcher_task =
            tokio::spawn(async move { fetcher.run(signal_rx, result_tx, cancel_rx).await });

        let engine_result = engine.run(batch_rx, result_rx, shutdown).await;

        let _ = cancel_tx.send(true);
        let listener_result = join_task(listener_task).await;
        let fetcher_result = join_task(fetcher_task).await;

        // A listener/fetcher failure is the root cause when the engine only
        // saw its input channel close; report it first.
        listener_result.and(fetcher_result).and(engine_result)
    }

    async fn stop(&self) -> Result<()> {
        // Ask the listener for a protocol-level clean close; best effort.
        let _ = self.close_tx.try_send(());
        Ok(())
    }
}

async fn join_task(handle: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Feed task join failed");
            Err(Error::StreamRead(format!("task join failed: {e}")))
        }
    }
}
