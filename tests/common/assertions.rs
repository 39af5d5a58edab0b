//! Waiting helpers and custom assertions

use llm_batch::{BatchRunner, Event, JobId, JobStatus};
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

/// Outcome of waiting for a job to finish
#[derive(Debug, PartialEq)]
pub enum WaitResult {
    /// The job reached a terminal status
    Finished {
        /// Terminal status
        status: JobStatus,
        /// Successful requests
        success: i64,
        /// Failed requests
        failed: i64,
    },
    /// Timeout waiting for the job
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for the `JobFinished` event of `id`
///
/// Subscribe before starting the runner so the event cannot be missed.
pub async fn wait_for_finish(events: &mut Receiver<Event>, id: JobId, timeout: Duration) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::JobFinished {
                    id: event_id,
                    status,
                    success,
                    failed,
                }) if event_id == id => {
                    return WaitResult::Finished {
                        status,
                        success,
                        failed,
                    };
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}

/// Wait until the runner has no live processor for `id`
pub async fn wait_until_idle(runner: &BatchRunner, id: JobId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while runner.is_live(id).await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} never released its processor",
            id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Assert the stored per-status request counts of a job
pub async fn assert_request_counts(runner: &BatchRunner, id: JobId, success: i64, failed: i64) {
    let counts = runner
        .db()
        .get_status_counts(id)
        .await
        .expect("Failed to count requests");
    assert_eq!(
        (counts.success, counts.failed, counts.non_terminal()),
        (success, failed, 0),
        "unexpected request counts for job {}: {:?}",
        id,
        counts
    );
}
