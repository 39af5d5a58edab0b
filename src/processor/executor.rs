//! Per-request attempt loop.

use super::cache::RequestCache;
use crate::config::Config;
use crate::db::{Database, Endpoint, Request};
use crate::error::UpstreamError;
use crate::retry::{IsRetryable, backoff_delay};
use crate::types::{JobId, RequestStatus};
use crate::upstream::ChatClient;
use crate::utils::{PauseWait, now_millis, wait_while_paused};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

/// Everything the executors of one job share
pub(crate) struct ExecutorContext {
    pub(crate) job_id: JobId,
    pub(crate) max_attempts: u32,
    pub(crate) endpoint: Endpoint,
    pub(crate) cache: Arc<RequestCache>,
    pub(crate) db: Arc<Database>,
    pub(crate) client: Arc<dyn ChatClient>,
    pub(crate) config: Arc<Config>,
    /// Cancelled when the job is deleted or the engine shuts down
    pub(crate) cancel: CancellationToken,
}

impl ExecutorContext {
    /// Wait out a pause; `false` means the request must stop
    async fn ready(&self) -> bool {
        match wait_while_paused(
            &self.db,
            self.job_id,
            self.config.processor.pause_check_interval,
            &self.cancel,
        )
        .await
        {
            PauseWait::Ready => !self.cancel.is_cancelled(),
            PauseWait::JobGone | PauseWait::Cancelled => false,
        }
    }

    async fn log_upstream_error(&self, request: &Request, attempt: u32, error: &UpstreamError) {
        let message = format!(
            "Request {} attempt {}/{}: {}",
            request.request_index,
            attempt + 1,
            self.max_attempts,
            error
        );
        if let Err(e) = self
            .db
            .log_error(
                self.job_id,
                Some(request.id),
                error.kind(),
                &message,
                error.details().as_deref(),
            )
            .await
        {
            tracing::debug!(job_id = %self.job_id, request_id = %request.id, error = %e, "Could not record request error");
        }
    }
}

/// Drive one request through its attempts, then release `permit`
///
/// Attempts continue from the request's stored `retry_count`, so a requeued
/// request never gets more than `max_attempts` tries in total.
pub(crate) async fn execute_request(
    ctx: Arc<ExecutorContext>,
    request: Request,
    permit: OwnedSemaphorePermit,
) {
    let _permit = permit;
    let id = request.id;

    if request.retry_count >= ctx.max_attempts {
        tracing::warn!(job_id = %ctx.job_id, request_id = %id, "Request has no attempts left");
        ctx.cache
            .mark_failed(id, now_millis(), request.retry_count, RequestStatus::Failed)
            .await;
        return;
    }

    for attempt in request.retry_count..ctx.max_attempts {
        if !ctx.ready().await {
            tracing::debug!(job_id = %ctx.job_id, request_id = %id, "Request stopped before attempt");
            return;
        }

        let status = if attempt == 0 {
            RequestStatus::Processing
        } else {
            RequestStatus::Retrying
        };
        ctx.cache.mark_status(id, status, Some(now_millis())).await;

        let result = tokio::select! {
            result = ctx.client.chat_completion(&ctx.endpoint, &request.messages) => result,
            _ = ctx.cancel.cancelled() => {
                tracing::debug!(job_id = %ctx.job_id, request_id = %id, "Request cancelled mid-call");
                return;
            }
        };

        let error = match result {
            Ok(completion) => {
                tracing::debug!(
                    job_id = %ctx.job_id,
                    request_id = %id,
                    attempt = attempt + 1,
                    total_tokens = completion.total_tokens,
                    "Request succeeded"
                );
                ctx.cache.mark_success(id, completion, now_millis()).await;
                return;
            }
            Err(e) => e,
        };

        ctx.log_upstream_error(&request, attempt, &error).await;
        let consumed = attempt + 1;

        if !error.is_retryable() {
            tracing::error!(job_id = %ctx.job_id, request_id = %id, error = %error, "Request failed with unexpected error");
            ctx.cache
                .mark_failed(id, now_millis(), consumed, RequestStatus::Failed)
                .await;
            return;
        }

        if consumed >= ctx.max_attempts {
            tracing::warn!(
                job_id = %ctx.job_id,
                request_id = %id,
                attempts = consumed,
                error = %error,
                "Request failed, attempts exhausted"
            );
            ctx.cache
                .mark_failed(id, now_millis(), consumed, RequestStatus::Failed)
                .await;
            return;
        }

        if !ctx.ready().await {
            return;
        }
        ctx.cache
            .mark_failed(id, now_millis(), consumed, RequestStatus::Retrying)
            .await;

        let delay = backoff_delay(&ctx.config.retry, attempt);
        tracing::warn!(
            job_id = %ctx.job_id,
            request_id = %id,
            attempt = consumed,
            max_attempts = ctx.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retryable upstream error, backing off"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancel.cancelled() => return,
        }
    }
}
