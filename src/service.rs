//! Long-running job abstraction and its supervisor
//!
//! Every independent job (depth synchronization, metrics export, candle
//! collection) implements [`Service`]. The supervisor starts all of them,
//! waits for the first terminal exit or a termination signal, fans the
//! shutdown out over a shared watch channel, stops every service, then joins
//! the run tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::Result;

/// A supervised long-running job
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// One-time setup before any job runs
    async fn init(&self) -> Result<()>;

    /// Blocks until done, cancelled, or a fatal error. Observing the shutdown
    /// signal is a clean exit, not an error.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()>;

    /// Graceful shutdown request, invoked while `run` may still be in flight;
    /// a service whose run loop blocks on more than the shutdown signal
    /// unblocks it here.
    async fn stop(&self) -> Result<()>;
}

/// Run all services until the first terminal exit or termination signal
pub async fn run_services(services: Vec<Arc<dyn Service>>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for svc in &services {
        if let Err(e) = svc.init().await {
            error!(service = svc.name(), error = %e, "Service initialisation failed");
            return Err(e);
        }
        info!(service = svc.name(), "Service initialised");
    }

    let mut tasks: JoinSet<(usize, Result<()>)> = JoinSet::new();
    for (index, svc) in services.iter().enumerate() {
        let svc = Arc::clone(svc);
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { (index, svc.run(rx).await) });
    }
    drop(shutdown_rx);

    let mut results = Vec::new();

    tokio::select! {
        joined = tasks.join_next() => {
            match joined {
                Some(Ok((index, result))) => {
                    info!(service = services[index].name(), "First service exited, shutting down");
                    results.push((index, result));
                }
                Some(Err(e)) => error!(error = %e, "Service task panicked"),
                None => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Termination signal received, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);

    // Stop before joining; a run loop may be blocked on something only its
    // stop hook releases (e.g. the depth feed's clean-close handshake).
    for svc in &services {
        if let Err(e) = svc.stop().await {
            error!(service = svc.name(), error = %e, "Service stop failed");
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => results.push(entry),
            Err(e) => error!(error = %e, "Service task panicked"),
        }
    }

    let mut first_error = None;
    for (index, result) in results {
        match result {
            Ok(()) => info!(service = services[index].name(), "Service stopped"),
            Err(e) => {
                error!(service = services[index].name(), error = %e, "Service terminated with error");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
