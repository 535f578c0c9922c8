//! Periodic enforcement of execution deadlines

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cancellation::CancellationHandler;
use super::executor::{ChainExecutor, Termination};
use crate::domain::chain::{ChainError, ExecutionFilter};
use crate::infrastructure::observability::record_timeout;

/// Moves every active execution past its deadline to `timed_out`, whatever
/// it is doing at the time
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    executor: Arc<ChainExecutor>,
    cancellation: CancellationHandler,
    interval: Duration,
}

impl TimeoutSupervisor {
    pub fn new(executor: Arc<ChainExecutor>, interval: Duration) -> Self {
        Self {
            cancellation: CancellationHandler::new(executor.clone()),
            executor,
            interval,
        }
    }

    /// Time out every active execution expired at `now`; returns how many were
    /// moved. Children of a timed-out execution are cancelled.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, ChainError> {
        let active = self
            .executor
            .executions()
            .list(&ExecutionFilter::active())
            .await?;

        let mut timed_out = 0;
        for execution in active.iter().filter(|e| e.is_expired(now)) {
            match self
                .executor
                .terminate(execution.chain_id(), &Termination::TimedOut)
                .await
            {
                Ok(terminated) => {
                    timed_out += 1;
                    record_timeout();
                    warn!(
                        chain_id = %execution.chain_id(),
                        chain = %execution.chain_name(),
                        expires_at = ?execution.expires_at(),
                        "Chain execution timed out"
                    );

                    if let Some(child_id) = terminated.active_child {
                        self.cancellation.cancel_descendants(child_id, None).await;
                    }
                }
                // Finished while the sweep was running
                Err(ChainError::Conflict(_)) => {}
                Err(e) => {
                    warn!(
                        chain_id = %execution.chain_id(),
                        error = %e,
                        "Failed to time out chain execution"
                    );
                }
            }
        }

        if timed_out > 0 {
            info!(count = timed_out, "Timeout sweep finished");
        }

        Ok(timed_out)
    }

    pub async fn sweep(&self) -> Result<usize, ChainError> {
        self.sweep_at(Utc::now()).await
    }

    /// Run the sweep every `interval` until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Timeout supervisor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Timeout sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Timeout supervisor stopping");
                        return;
                    }
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
