//! Background tasks that live for the duration of one job: cache flushing,
//! performance recomputation and the deletion watchdog.

use super::cache::RequestCache;
use crate::db::Database;
use crate::performance::record_performance;
use crate::types::JobId;
use crate::utils::job_exists;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

/// Spawn a task that flushes the cache every `period`, or as soon as a batch fills up
pub(crate) fn spawn_cache_flusher(
    cache: Arc<RequestCache>,
    period: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cache.batch_ready() => {}
                _ = cancel_token.cancelled() => break,
            }
            if let Err(e) = cache.flush(false).await {
                tracing::warn!(job_id = %cache.job_id(), error = %e, "Periodic flush failed");
            }
        }
    })
}

/// Spawn a task that recomputes the job's performance snapshot every `period`
///
/// Stops on its own once the job no longer exists.
pub(crate) fn spawn_performance_updater(
    job_id: JobId,
    db: Arc<Database>,
    period: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !job_exists(&db, job_id).await {
                        tracing::debug!(job_id = %job_id, "Job gone, stopping performance updates");
                        break;
                    }
                    record_performance(&db, job_id).await;
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    })
}

/// Spawn a task that polls for the job's deletion
///
/// On deletion it sets `deleted` and cancels `job_token`, which stops every
/// in-flight request of the job at its next suspension point.
pub(crate) fn spawn_deletion_watchdog(
    job_id: JobId,
    db: Arc<Database>,
    period: Duration,
    deleted: Arc<AtomicBool>,
    job_token: CancellationToken,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !job_exists(&db, job_id).await {
                        tracing::info!(job_id = %job_id, "Job deleted mid-run, cancelling its requests");
                        deleted.store(true, Ordering::SeqCst);
                        job_token.cancel();
                        break;
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    })
}
