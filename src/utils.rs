//! Support utilities shared by the scheduler, job processor and request executor
//!
//! - job existence and pause checks that fail safe (a lookup error reads as "gone")
//! - cooperative cancellation of background tasks
//! - an error-contain-and-continue wrapper for best-effort work
//! - timestamp helpers

use crate::db::{Database, Job};
use crate::types::{JobId, JobStatus};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Current time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Render a unix-millisecond timestamp as `YYYY-MM-DD HH:MM:SS` (UTC)
pub fn format_timestamp(millis: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// Render a span in seconds as e.g. `1h 02m 03s`, `4m 05s` or `6.7s`
pub fn format_duration_secs(secs: f64) -> String {
    if !secs.is_finite() || secs < 0.0 {
        return "-".to_string();
    }
    if secs < 60.0 {
        return format!("{:.1}s", secs);
    }
    let total = secs.round() as u64;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else {
        format!("{}m {:02}s", minutes, seconds)
    }
}

/// Fetch a job, treating a lookup failure like a missing job
pub async fn job_details_safe(db: &Database, job_id: JobId) -> Option<Job> {
    match db.get_job(job_id).await {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Job lookup failed, treating job as gone");
            None
        }
    }
}

/// Whether the job still exists (a lookup failure counts as "no")
pub async fn job_exists(db: &Database, job_id: JobId) -> bool {
    job_details_safe(db, job_id).await.is_some()
}

/// Outcome of [`wait_while_paused`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseWait {
    /// The job exists and is not paused
    Ready,
    /// The job no longer exists
    JobGone,
    /// The cancellation token fired while waiting
    Cancelled,
}

/// Park until the job is no longer paused
///
/// Polls the job status every `interval`. There is no timeout: a job that stays
/// paused keeps its caller parked until it is resumed, deleted or cancelled.
pub async fn wait_while_paused(
    db: &Database,
    job_id: JobId,
    interval: Duration,
    cancel: &CancellationToken,
) -> PauseWait {
    let mut logged = false;
    loop {
        if cancel.is_cancelled() {
            return PauseWait::Cancelled;
        }
        match job_details_safe(db, job_id).await {
            None => return PauseWait::JobGone,
            Some(job) if job.status != JobStatus::Paused => return PauseWait::Ready,
            Some(_) => {
                if !logged {
                    tracing::debug!(job_id = %job_id, "Job paused, waiting");
                    logged = true;
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return PauseWait::Cancelled,
        }
    }
}

/// Cancel background tasks and wait for them to stop
///
/// Fires `token`, then awaits every handle. Cancellation acknowledgements are
/// absorbed; a task that panicked is logged and otherwise ignored.
pub async fn cancel_tasks_safely(
    job_id: JobId,
    token: &CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
) {
    token.cancel();

    let (names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
    let results = futures::future::join_all(handles).await;
    for (name, result) in names.into_iter().zip(results) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(job_id = %job_id, task = name, error = %e, "Background task failed during cancellation");
            }
        }
    }
}

/// Run best-effort work, logging a failure and returning `default` instead
pub async fn log_and_continue<T, F>(operation: &str, job_id: JobId, default: T, fut: F) -> T
where
    F: Future<Output = crate::Result<T>>,
{
    match fut.await {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(job_id = %job_id, operation, error = %e, "Operation failed, continuing");
            default
        }
    }
}
