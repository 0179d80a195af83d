//! Reconciliation engine
//!
//! Single consumer of diff batches and snapshot results, and the only mutator
//! of the order book. Batches arriving before the snapshot are buffered and
//! version-checked; the snapshot is validated against the buffer, applied, and
//! the buffer replayed on top exactly once. After that every batch must extend
//! the applied version range without a gap, and any discontinuity is fatal.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::book::{OrderBook, Side, TopOfBook};
use crate::error::{Error, Result};
use crate::feed::{DiffBatch, Snapshot, SnapshotRequester};
use crate::metrics::Metrics;

const EXCHANGE: &str = "binance";

enum State {
    /// Buffering batches until a usable snapshot arrives.
    /// `next_first` is the first update id the next buffered batch must carry.
    Bootstrapping {
        buffer: Vec<DiffBatch>,
        next_first: Option<u64>,
    },
    /// Snapshot merged; every batch must continue the applied range.
    Live { last_applied: u64 },
}

/// State machine reconciling the push feed with point-in-time snapshots
pub struct ReconcileEngine {
    book: OrderBook,
    state: State,
    requester: SnapshotRequester,
    top_tx: watch::Sender<TopOfBook>,
    metrics: Arc<Metrics>,
}

impl ReconcileEngine {
    pub fn new(
        symbol: &str,
        granularity: Option<rust_decimal::Decimal>,
        requester: SnapshotRequester,
        top_tx: watch::Sender<TopOfBook>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            book: OrderBook::new(symbol, granularity),
            state: State::Bootstrapping {
                buffer: Vec::new(),
                next_first: None,
            },
            requester,
            top_tx,
            metrics,
        }
    }

    /// Consume inputs until shutdown. Any returned error is terminal for this
    /// engine instance; recovery is a fresh bootstrap under the supervisor.
    pub async fn run(
        &mut self,
        mut batch_rx: mpsc::Receiver<DiffBatch>,
        mut snapshot_rx: mpsc::Receiver<Result<Snapshot>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                batch = batch_rx.recv() => {
                    match batch {
                        Some(batch) => self.on_batch(batch)?,
                        None if *shutdown.borrow() => return Ok(()),
                        None => return Err(Error::ChannelClosed("diff-batch")),
                    }
                }
                result = snapshot_rx.recv() => {
                    match result {
                        Some(result) => self.on_snapshot(result?)?,
                        None if *shutdown.borrow() => return Ok(()),
                        None => return Err(Error::ChannelClosed("snapshot")),
                    }
                }
            }
        }
    }

    /// Feed one diff batch into the state machine
    pub fn on_batch(&mut self, batch: DiffBatch) -> Result<()> {
        match &mut self.state {
            State::Bootstrapping { buffer, next_first } => {
                if buffer.is_empty() {
                    // First batch seen: fetch a snapshot whose window overlaps
                    // the buffer we are about to accumulate.
                    info!(
                        first = batch.first_update_id,
                        "First diff batch received, requesting snapshot"
                    );
                    self.requester.request();
                }

                if let Some(expected) = *next_first {
                    if batch.first_update_id != expected {
                        return Err(Error::ContinuityGap {
                            expected,
                            got: batch.first_update_id,
                        });
                    }
                }

                *next_first = Some(batch.final_update_id + 1);
                buffer.push(batch);
                Ok(())
            }
            State::Live { last_applied } => {
                let expected = *last_applied + 1;
                if batch.first_update_id != expected {
                    return Err(Error::ContinuityGap {
                        expected,
                        got: batch.first_update_id,
                    });
                }

                *last_applied = batch.final_update_id;
                let last_applied = batch.final_update_id;
                self.apply(&batch);
                self.publish_top(last_applied);
                Ok(())
            }
        }
    }

    /// Feed one fetched snapshot into the state machine
    pub fn on_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let State::Bootstrapping { buffer, .. } = &mut self.state else {
            warn!(
                last_update_id = snapshot.last_update_id,
                "Snapshot received while live, ignoring"
            );
            return Ok(());
        };

        let Some(first_buffered) = buffer.first() else {
            // The fetch raced ahead of the feed; try again once batches exist.
            debug!("Snapshot arrived before any diff batch, refetching");
            self.requester.request();
            return Ok(());
        };

        let min_first = first_buffered.first_update_id;
        if snapshot.last_update_id + 1 < min_first {
            info!(
                last_update_id = snapshot.last_update_id,
                min_first, "Snapshot predates buffered updates, refetching"
            );
            self.requester.request();
            return Ok(());
        }

        let buffer = std::mem::take(buffer);

        self.book.apply_batch(Side::Ask, &snapshot.asks);
        self.book.apply_batch(Side::Bid, &snapshot.bids);

        let mut replayed = 0usize;
        for batch in &buffer {
            if batch.final_update_id <= snapshot.last_update_id {
                // Already covered by the snapshot.
                continue;
            }
            self.apply(batch);
            replayed += 1;
        }

        // The buffer chain is gapless and tracks the stream, so the final
        // buffered id is the applied frontier even when every batch fell
        // inside the snapshot. Diff amounts are absolute; overlap with the
        // snapshot is harmless, only gaps are fatal.
        let last_applied = buffer
            .last()
            .map_or(snapshot.last_update_id, |b| b.final_update_id);

        self.state = State::Live { last_applied };
        self.publish_top(last_applied);
        info!(
            last_applied,
            buffered = buffer.len(),
            replayed,
            "Order book bootstrap complete"
        );
        Ok(())
    }

    /// Lowest resting ask, served from engine-owned state
    pub fn best_ask(&self) -> Option<rust_decimal::Decimal> {
        self.book.best_ask()
    }

    /// Highest resting bid, served from engine-owned state
    pub fn best_bid(&self) -> Option<rust_decimal::Decimal> {
        self.book.best_bid()
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, State::Live { .. })
    }

    pub fn last_applied(&self) -> Option<u64> {
        match self.state {
            State::Live { last_applied } => Some(last_applied),
            State::Bootstrapping { .. } => None,
        }
    }

    fn apply(&mut self, batch: &DiffBatch) {
        self.book.apply_batch(Side::Ask, &batch.asks);
        self.book.apply_batch(Side::Bid, &batch.bids);
        self.metrics
            .book_updates
            .with_label_values(&[EXCHANGE, self.book.symbol()])
            .inc();
    }

    fn publish_top(&self, last_applied: u64) {
        let _ = self.top_tx.send(TopOfBook {
            best_bid: self.book.best_bid(),
            best_ask: self.book.best_ask(),
            last_applied,
        });
    }
}
