//! Reconciliation loop driving the orchestrator.
//!
//! The reconciler:
//! - Runs one orchestrator tick per poll interval
//! - Skips (never queues) timer fires that land while a tick is running
//! - On shutdown, lets the in-flight tick finish before returning

use std::sync::Arc;
use std::time::Duration;

use magick_reconcile::DEFAULT_RECONCILE_INTERVAL;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::{Orchestrator, TickOutcome};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between ticks.
    pub poll_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}

/// Drives an orchestrator on a fixed interval.
pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(orchestrator: Arc<Orchestrator>, config: ReconcilerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Spawn the loop on the current runtime.
    pub fn start(orchestrator: Arc<Orchestrator>, config: ReconcilerConfig) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Self::new(orchestrator, config);
        let task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

        ReconcilerHandle { shutdown_tx, task }
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// Returns an error only when a tick reports an unrecoverable internal
    /// error; every other failure is retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                // Shutdown wins over a due tick
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.orchestrator.tick().await {
                        Ok(TickOutcome::Skipped) => debug!("Tick skipped"),
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Reconciliation loop stopping");
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Handle to a running reconciliation loop.
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ReconcilerHandle {
    /// Stop the loop, waiting for an in-flight tick to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        flatten(self.task.await)
    }

    /// Wait for the loop to exit on its own, which only happens on a fatal
    /// error. Do not call [`stop`](Self::stop) after this returns.
    pub async fn wait(&mut self) -> Result<()> {
        flatten((&mut self.task).await)
    }

    /// Returns true once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| OrchestratorError::Internal(format!("reconciliation task panicked: {e}")))?
}
