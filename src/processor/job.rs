//! One job's end-to-end lifecycle.
//!
//! `pending -> processing -> {completed | failed}`. Requests run under a
//! semaphore sized to the job's concurrency; the cache, performance and
//! deletion tasks run alongside them. Cleanup always flushes the cache and
//! finalizes stragglers before the terminal status is decided.

use super::EngineContext;
use super::background_tasks::{
    spawn_cache_flusher, spawn_deletion_watchdog, spawn_performance_updater,
};
use super::cache::RequestCache;
use super::executor::{ExecutorContext, execute_request};
use crate::db::{Endpoint, FinalizeMode, Job, StatusCounts};
use crate::performance::record_performance;
use crate::types::{ErrorKind, Event, JobId, JobStatus};
use crate::utils::{
    cancel_tasks_safely, format_duration_secs, job_exists, log_and_continue, now_millis,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Final cache flush attempts before a job is left for recovery
const FINAL_FLUSH_ATTEMPTS: u32 = 3;
const FINAL_FLUSH_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Terminal status for a job from its final counts
///
/// `completed` when every request is accounted for (and there is at least
/// one), or when the job has no requests at all; `failed` otherwise. A job
/// whose requests all failed is `failed` as well.
pub fn decide_job_status(success: i64, failed: i64, total: i64) -> JobStatus {
    if total == 0 {
        return JobStatus::Completed;
    }
    if success + failed >= total && success > 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}

/// Runs one job to a terminal status
pub(crate) struct JobProcessor {
    ctx: EngineContext,
    job: Job,
    endpoint: Option<Endpoint>,
    /// Cancelled on deletion or engine shutdown
    cancel: CancellationToken,
    deleted: Arc<AtomicBool>,
    /// Unix ms when this processor took the job
    started_at: i64,
}

impl JobProcessor {
    pub(crate) fn new(
        ctx: EngineContext,
        job: Job,
        endpoint: Option<Endpoint>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            job,
            endpoint,
            cancel,
            deleted: Arc::new(AtomicBool::new(false)),
            started_at: now_millis(),
        }
    }

    fn id(&self) -> JobId {
        self.job.id
    }

    /// Run the job; returns the terminal status it was given, if any
    ///
    /// `None` means the job was no longer pending when claimed, was deleted,
    /// or was interrupted. An interrupted job (engine shutdown, or request
    /// updates that could not be saved) stays `processing` for the next
    /// recovery sweep.
    pub(crate) async fn run(self) -> Option<JobStatus> {
        let id = self.id();
        let db = &self.ctx.db;

        match db.start_pending_job(id, self.started_at).await {
            Ok(true) => {}
            Ok(false) => {
                match db.get_job(id).await {
                    Ok(Some(job)) => tracing::info!(
                        job_id = %id,
                        status = %job.status,
                        "Job no longer pending, not starting"
                    ),
                    Ok(None) => tracing::info!(job_id = %id, "Job vanished before it started"),
                    Err(e) => tracing::warn!(job_id = %id, error = %e, "Job not claimed"),
                }
                return None;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to mark job processing");
                return None;
            }
        }

        let endpoint = match self.endpoint.clone() {
            Some(endpoint) if endpoint.is_active => endpoint,
            other => {
                let message = match other {
                    Some(endpoint) => format!("Endpoint '{}' is not active", endpoint.alias),
                    None => format!("Endpoint {} does not exist", self.job.endpoint_id),
                };
                return Some(self.fail_job(ErrorKind::Configuration, &message).await);
            }
        };

        let writer = self.ctx.writer.clone();
        let cache = match RequestCache::load(db, id, writer, &self.ctx.config.cache).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                let message = format!("Failed to load requests: {}", e);
                return Some(self.fail_job(ErrorKind::SystemError, &message).await);
            }
        };

        let pending = cache.pending_requests().await;
        self.ctx.emit(Event::JobStarted {
            id,
            pending: pending.len(),
        });

        if pending.is_empty() {
            tracing::info!(job_id = %id, "No pending requests, finalizing");
            record_performance(db, id).await;
            return self.finalize_job().await;
        }

        tracing::info!(
            job_id = %id,
            name = %self.job.name,
            pending = pending.len(),
            concurrency = self.job.concurrency,
            max_attempts = self.job.max_attempts,
            "Job started"
        );

        let background_token = self.cancel.child_token();
        let processor_config = &self.ctx.config.processor;
        let background = vec![
            (
                "cache_flusher",
                spawn_cache_flusher(
                    cache.clone(),
                    self.ctx.config.cache.flush_interval,
                    background_token.clone(),
                ),
            ),
            (
                "performance_updater",
                spawn_performance_updater(
                    id,
                    db.clone(),
                    processor_config.performance_update_interval,
                    background_token.clone(),
                ),
            ),
            (
                "deletion_watchdog",
                spawn_deletion_watchdog(
                    id,
                    db.clone(),
                    processor_config.deletion_check_interval,
                    self.deleted.clone(),
                    self.cancel.clone(),
                    background_token.clone(),
                ),
            ),
        ];

        self.run_requests(endpoint, cache.clone(), pending).await;

        // Cleanup runs whatever happened above
        cancel_tasks_safely(id, &background_token, background).await;

        if self.deleted.load(Ordering::SeqCst) {
            tracing::info!(job_id = %id, "Job deleted mid-run, skipping final writes");
            return None;
        }

        let flushed = self.final_flush(&cache).await;

        if self.cancel.is_cancelled() {
            tracing::info!(job_id = %id, "Job interrupted, leaving it for recovery");
            return None;
        }
        if !flushed {
            tracing::error!(
                job_id = %id,
                "Request updates could not be saved, leaving job for recovery"
            );
            return None;
        }

        let max_attempts = self.job.max_attempts;
        let early = log_and_continue("conditional finalize", id, Default::default(), async {
            db.finalize_requests(id, FinalizeMode::Conditional { max_attempts })
                .await
        })
        .await;
        if early.total() > 0 {
            tracing::debug!(
                job_id = %id,
                succeeded = early.succeeded,
                failed = early.failed,
                "Conditional finalize terminalized requests"
            );
        }

        if !job_exists(db, id).await {
            tracing::info!(job_id = %id, "Job deleted during cleanup, skipping final writes");
            return None;
        }

        record_performance(db, id).await;
        self.finalize_job().await
    }

    /// Write every dirty request back, retrying a few times
    ///
    /// Returns false if updates are still unsaved after the last attempt.
    async fn final_flush(&self, cache: &RequestCache) -> bool {
        let id = self.id();
        for attempt in 1..=FINAL_FLUSH_ATTEMPTS {
            match cache.flush(true).await {
                Ok(_) => return true,
                Err(e) => {
                    let dirty = cache.dirty_count().await;
                    tracing::warn!(
                        job_id = %id,
                        attempt,
                        dirty,
                        error = %e,
                        "Final flush failed"
                    );
                }
            }
            if attempt < FINAL_FLUSH_ATTEMPTS {
                tokio::time::sleep(FINAL_FLUSH_RETRY_PAUSE).await;
            }
        }
        false
    }

    /// Launch one executor per pending request under the job's semaphore and wait for all
    async fn run_requests(
        &self,
        endpoint: Endpoint,
        cache: Arc<RequestCache>,
        pending: Vec<crate::db::Request>,
    ) {
        let id = self.id();
        let semaphore = Arc::new(Semaphore::new(self.job.concurrency.max(1) as usize));
        let executor_ctx = Arc::new(ExecutorContext {
            job_id: id,
            max_attempts: self.job.max_attempts.max(1),
            endpoint,
            cache,
            db: self.ctx.db.clone(),
            client: self.ctx.client.clone(),
            config: self.ctx.config.clone(),
            cancel: self.cancel.clone(),
        });

        let mut requests = JoinSet::new();
        for request in pending {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            requests.spawn(execute_request(executor_ctx.clone(), request, permit));
        }

        while let Some(result) = requests.join_next().await {
            if let Err(e) = result {
                tracing::error!(job_id = %id, error = %e, "Request task failed");
            }
        }
    }

    /// Unconditional finalize, total reconciliation, statistics and terminal status
    async fn finalize_job(&self) -> Option<JobStatus> {
        let id = self.id();
        let db = &self.ctx.db;

        let stragglers = log_and_continue("unconditional finalize", id, Default::default(), async {
            db.finalize_requests(id, FinalizeMode::Unconditional).await
        })
        .await;
        if stragglers.total() > 0 {
            tracing::warn!(
                job_id = %id,
                succeeded = stragglers.succeeded,
                failed = stragglers.failed,
                "Terminalized non-terminal requests at job end"
            );
        }

        let mut total = self.job.total_requests;
        let actual = log_and_continue("count requests", id, total, async {
            db.count_requests_for_job(id).await
        })
        .await;
        if actual != total {
            tracing::warn!(job_id = %id, stored = total, actual, "Correcting job request total");
            log_and_continue("correct request total", id, (), async {
                db.set_job_total_requests(id, actual).await
            })
            .await;
            total = actual;
        }

        let counts: StatusCounts = log_and_continue("status counts", id, Default::default(), async {
            db.get_status_counts(id).await
        })
        .await;
        log_and_continue("write job stats", id, (), async {
            db.set_job_stats(id, counts.success, counts.failed).await
        })
        .await;

        let status = decide_job_status(counts.success, counts.failed, total);
        let completed_at = now_millis();
        let written = log_and_continue("write terminal status", id, false, async {
            db.set_job_status(id, status, None, Some(completed_at)).await
        })
        .await;
        if !written {
            return None;
        }

        tracing::info!(
            job_id = %id,
            status = %status,
            success = counts.success,
            failed = counts.failed,
            total,
            elapsed = %format_duration_secs((completed_at - self.started_at) as f64 / 1000.0),
            "Job finished"
        );
        self.ctx.emit(Event::JobFinished {
            id,
            status,
            success: counts.success,
            failed: counts.failed,
        });
        Some(status)
    }

    /// Fail the job without attempting any request
    async fn fail_job(&self, kind: ErrorKind, message: &str) -> JobStatus {
        let id = self.id();
        let db = &self.ctx.db;
        tracing::error!(job_id = %id, kind = %kind, "{}", message);

        log_and_continue("log job error", id, 0, async {
            db.log_error(id, None, kind, message, None).await
        })
        .await;
        log_and_continue("mark job failed", id, false, async {
            db.set_job_status(id, JobStatus::Failed, None, Some(now_millis()))
                .await
        })
        .await;

        self.ctx.emit(Event::JobFinished {
            id,
            status: JobStatus::Failed,
            success: self.job.success_count,
            failed: self.job.failed_count,
        });
        JobStatus::Failed
    }
}
