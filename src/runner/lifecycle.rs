//! Startup and shutdown coordination.

use crate::error::{Error, Result};
use crate::processor::Scheduler;
use std::time::Duration;

use super::BatchRunner;

/// Interval between checks while waiting for job processors to stop
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl BatchRunner {
    /// Spawn the scheduler
    ///
    /// The scheduler runs a recovery sweep, then keeps launching pending jobs
    /// until [`BatchRunner::shutdown`]. Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.scheduler_token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let mut handle = self.scheduler_handle.lock().await;
        if handle.is_some() {
            tracing::debug!("Scheduler already running");
            return Ok(());
        }

        let scheduler = Scheduler::new(self.ctx.clone());
        *handle = Some(tokio::spawn(scheduler.run(self.scheduler_token.clone())));
        tracing::info!("Batch runner started");
        Ok(())
    }

    /// Gracefully shut down
    ///
    /// 1. Stops the scheduler
    /// 2. Cancels every live job processor (their answered requests are flushed)
    /// 3. Waits up to `shutdown_timeout` for the processors to exit
    /// 4. Marks a clean shutdown in the store
    ///
    /// Interrupted jobs stay `processing` and are picked up by the next
    /// recovery sweep.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.scheduler_token.cancel();
        if let Some(handle) = self.scheduler_handle.lock().await.take()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Scheduler task failed");
        }

        {
            let live = self.ctx.live_jobs.lock().await;
            tracing::debug!(live_count = live.len(), "Cancelling live jobs");
            for (id, token) in live.iter() {
                tracing::debug!(job_id = %id, "Signaling job to stop");
                token.cancel();
            }
        }

        let timeout = self.ctx.config.shutdown_timeout;
        match tokio::time::timeout(timeout, self.wait_for_live_jobs()).await {
            Ok(()) => tracing::info!("All job processors stopped"),
            Err(_) => tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Timeout waiting for job processors, proceeding with shutdown"
            ),
        }

        if let Err(e) = self.ctx.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
        } else {
            tracing::info!("Marked clean shutdown in database");
        }

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_live_jobs(&self) {
        loop {
            let live_count = self.ctx.live_jobs.lock().await.len();
            if live_count == 0 {
                return;
            }
            tracing::debug!(live_count, "Waiting for job processors to stop");
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}
