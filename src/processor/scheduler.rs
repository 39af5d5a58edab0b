//! Scheduler: recovery sweep plus the pending-job polling loop.

use super::{EngineContext, JobProcessor};
use crate::db::{Endpoint, Job};
use crate::error::Result;
use crate::types::{Event, JobStatus};
use crate::utils::format_timestamp;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Discovers pending jobs and runs each on its own processor task
pub(crate) struct Scheduler {
    ctx: EngineContext,
}

impl Scheduler {
    pub(crate) fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Requeue jobs left in flight by a crash
    ///
    /// Covers jobs stuck in `processing` and `completed` jobs that still own
    /// non-terminal requests. Their non-terminal requests go back to `pending`
    /// with timestamps cleared and the job itself becomes `pending`; the second
    /// kind also has its counters cleared. Jobs with a live processor are
    /// skipped; launches and processor exits wait for the sweep to finish.
    /// Returns the number of jobs requeued.
    pub(crate) async fn recover(&self) -> Result<usize> {
        let db = &self.ctx.db;
        // Held for the whole sweep: no processor launches or exits while the
        // listed statuses are acted on.
        let live = self.ctx.live_jobs.lock().await;
        let stuck = db.list_jobs_by_status(JobStatus::Processing).await?;
        let incomplete = db.list_completed_jobs_with_open_requests().await?;

        let mut recovered = 0;

        for (job, clear_stats) in stuck
            .into_iter()
            .map(|job| (job, false))
            .chain(incomplete.into_iter().map(|job| (job, true)))
        {
            if live.contains_key(&job.id) {
                continue;
            }

            let reset = db.reset_non_terminal_requests(job.id).await?;
            if clear_stats {
                db.reset_job_stats(job.id).await?;
            }
            db.set_job_status(job.id, JobStatus::Pending, None, None)
                .await?;

            tracing::info!(
                job_id = %job.id,
                previous_status = %job.status,
                last_started = %job.started_at.map(format_timestamp).unwrap_or_else(|| "-".into()),
                requests_reset = reset,
                "Recovered interrupted job"
            );
            recovered += 1;
        }
        drop(live);

        if recovered > 0 {
            tracing::info!(count = recovered, "Recovery sweep requeued jobs");
            self.ctx.emit(Event::JobsRecovered { count: recovered });
        }
        Ok(recovered)
    }

    /// Launch a processor for every pending job; returns how many were launched
    pub(crate) async fn poll_once(&self) -> Result<usize> {
        let jobs = self.ctx.db.list_pending_jobs_with_endpoint().await?;
        let mut launched = 0;
        for (job, endpoint) in jobs {
            if self.launch(job, endpoint).await? {
                launched += 1;
            }
        }
        Ok(launched)
    }

    /// Spawn an independent processor task for `job`
    ///
    /// A job that already has a live processor (a paused job resumed mid-run) is
    /// only flipped back to `processing`.
    async fn launch(&self, job: Job, endpoint: Option<Endpoint>) -> Result<bool> {
        let id = job.id;
        let token = {
            let mut live = self.ctx.live_jobs.lock().await;
            if live.contains_key(&id) {
                drop(live);
                self.ctx
                    .db
                    .transition_job_status(id, &[JobStatus::Pending], JobStatus::Processing)
                    .await?;
                tracing::debug!(job_id = %id, "Job already has a live processor");
                return Ok(false);
            }
            let token = CancellationToken::new();
            live.insert(id, token.clone());
            token
        };

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let live_jobs = ctx.live_jobs.clone();
            let status = JobProcessor::new(ctx, job, endpoint, token).run().await;
            live_jobs.lock().await.remove(&id);
            tracing::debug!(job_id = %id, status = ?status, "Job processor exited");
        });

        Ok(true)
    }

    /// Run until `cancel` fires: recover, then poll and recover on their intervals
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let config = self.ctx.config.scheduler.clone();
        tracing::info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            recovery_interval_ms = config.recovery_interval.as_millis() as u64,
            "Scheduler started"
        );

        if let Err(e) = self.recover().await {
            tracing::error!(error = %e, "Startup recovery failed");
        }

        let mut recovery = tokio::time::interval_at(
            tokio::time::Instant::now() + config.recovery_interval,
            config.recovery_interval,
        );
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let pause = match self.poll_once().await {
                Ok(launched) => {
                    if launched > 0 {
                        tracing::info!(launched, "Launched pending jobs");
                    }
                    config.poll_interval
                }
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler poll failed");
                    config.error_retry_interval
                }
            };

            if !self.sleep_or_recover(pause, &mut recovery, &cancel).await {
                break;
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Sleep for `pause`, running recovery sweeps that fall due meanwhile
    ///
    /// Returns `false` once cancelled.
    async fn sleep_or_recover(
        &self,
        pause: Duration,
        recovery: &mut tokio::time::Interval,
        cancel: &CancellationToken,
    ) -> bool {
        let wake = tokio::time::sleep(pause);
        tokio::pin!(wake);

        loop {
            tokio::select! {
                _ = &mut wake => return true,
                _ = recovery.tick() => {
                    if let Err(e) = self.recover().await {
                        tracing::error!(error = %e, "Recovery sweep failed");
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }
}
