//! Periodic reconciliation runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::consistency::ConsistencyChecker;

pub struct ReconciliationScheduler {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl ReconciliationScheduler {
    /// Run the full check every `interval` until stopped. The first tick
    /// fires immediately.
    pub fn spawn(checker: Arc<ConsistencyChecker>, interval: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Reconciliation scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let results = tokio::select! {
                            _ = token.cancelled() => break,
                            results = checker.run_configured() => results,
                        };
                        let issues: usize = results.values().map(|r| r.inconsistent_count).sum();
                        if issues > 0 {
                            warn!(
                                checks = results.len(),
                                issues,
                                "Reconciliation found inconsistencies"
                            );
                        } else {
                            info!(checks = results.len(), "Reconciliation run clean");
                        }
                    }
                }
            }
        });

        Self { handle, shutdown }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the loop, abandoning a run in progress, and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Reconciliation scheduler task failed");
        }
    }
}
