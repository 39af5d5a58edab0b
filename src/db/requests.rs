//! Request listing, bulk write-back, resets and finalize.

use crate::error::DatabaseError;
use crate::types::{JobId, RequestStatus};
use crate::{Error, Result};

use super::{Database, FinalizeMode, FinalizeOutcome, Request, RequestRow, StatusCounts};

const REQUEST_COLUMNS: &str = r#"
    id, job_id, request_index, messages, status, retry_count, response_body,
    prompt_tokens, completion_tokens, total_tokens, started_at, completed_at
"#;

/// Predicate for a stored response that counts as a usable answer
const USABLE_RESPONSE: &str =
    "response_body IS NOT NULL AND response_body != '' AND total_tokens > 0";

/// Predicate for the three non-terminal statuses (pending, processing, retrying)
const NON_TERMINAL: &str = "status IN (0, 1, 4)";

impl Database {
    /// List a job's requests ordered by `request_index`, optionally filtered by status
    pub async fn list_requests_for_job(
        &self,
        job_id: JobId,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {} FROM requests WHERE job_id = ? AND status = ? ORDER BY request_index",
                    REQUEST_COLUMNS
                );
                sqlx::query_as::<_, RequestRow>(&query)
                    .bind(job_id)
                    .bind(status.to_i32())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "SELECT {} FROM requests WHERE job_id = ? ORDER BY request_index",
                    REQUEST_COLUMNS
                );
                sqlx::query_as::<_, RequestRow>(&query)
                    .bind(job_id)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list requests for job: {}",
                e
            )))
        })?;

        rows.into_iter().map(Request::try_from).collect()
    }

    /// Count the request rows a job actually owns
    pub async fn count_requests_for_job(&self, job_id: JobId) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count requests for job: {}",
                    e
                )))
            })
    }

    /// Per-status request counts for a job
    pub async fn get_status_counts(&self, job_id: JobId) -> Result<StatusCounts> {
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM requests WHERE job_id = ? GROUP BY status",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get status counts: {}",
                e
            )))
        })?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match RequestStatus::from_i32(status) {
                RequestStatus::Pending => counts.pending += count,
                RequestStatus::Processing => counts.processing += count,
                RequestStatus::Success => counts.success += count,
                RequestStatus::Failed => counts.failed += count,
                RequestStatus::Retrying => counts.retrying += count,
            }
        }
        Ok(counts)
    }

    /// Write back answered requests: status, response, tokens, attempts and timestamps
    pub async fn bulk_update_success(&self, requests: &[Request]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin_bulk("success").await?;
        for request in requests {
            sqlx::query(
                r#"
                UPDATE requests
                SET status = ?, response_body = ?, prompt_tokens = ?, completion_tokens = ?,
                    total_tokens = ?, retry_count = ?, started_at = ?, completed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(request.status.to_i32())
            .bind(&request.response_body)
            .bind(request.prompt_tokens)
            .bind(request.completion_tokens)
            .bind(request.total_tokens)
            .bind(request.retry_count as i64)
            .bind(request.started_at)
            .bind(request.completed_at)
            .bind(request.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update successful request {}: {}",
                    request.id, e
                )))
            })?;
        }
        commit_bulk(tx, "success").await
    }

    /// Write back failed requests: status, attempts and timestamps
    pub async fn bulk_update_failure(&self, requests: &[Request]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin_bulk("failure").await?;
        for request in requests {
            sqlx::query(
                r#"
                UPDATE requests
                SET status = ?, retry_count = ?, started_at = ?, completed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(request.status.to_i32())
            .bind(request.retry_count as i64)
            .bind(request.started_at)
            .bind(request.completed_at)
            .bind(request.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update failed request {}: {}",
                    request.id, e
                )))
            })?;
        }
        commit_bulk(tx, "failure").await
    }

    /// Write back processing/retrying requests: status, attempts and timestamps
    pub async fn bulk_update_in_flight(&self, requests: &[Request]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin_bulk("in-flight").await?;
        for request in requests {
            sqlx::query(
                r#"
                UPDATE requests
                SET status = ?, retry_count = ?, started_at = ?, completed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(request.status.to_i32())
            .bind(request.retry_count as i64)
            .bind(request.started_at)
            .bind(request.completed_at)
            .bind(request.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update in-flight request {}: {}",
                    request.id, e
                )))
            })?;
        }
        commit_bulk(tx, "in-flight").await
    }

    /// Requeue every non-terminal request of a job, clearing its timestamps
    ///
    /// Used by the recovery sweep. Returns the number of rows reset.
    pub async fn reset_non_terminal_requests(&self, job_id: JobId) -> Result<u64> {
        let query = format!(
            r#"
            UPDATE requests
            SET status = ?, started_at = NULL, completed_at = NULL
            WHERE job_id = ? AND {}
            "#,
            NON_TERMINAL
        );
        let result = sqlx::query(&query)
            .bind(RequestStatus::Pending.to_i32())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to reset non-terminal requests: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Requeue a job's processing/retrying requests, keeping their attempt count
    ///
    /// Used when a paused job is resumed. Returns the number of rows reset.
    pub async fn requeue_in_flight_requests(&self, job_id: JobId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE requests SET status = ? WHERE job_id = ? AND status IN (?, ?)",
        )
        .bind(RequestStatus::Pending.to_i32())
        .bind(job_id)
        .bind(RequestStatus::Processing.to_i32())
        .bind(RequestStatus::Retrying.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to requeue in-flight requests: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Give failed requests a fresh attempt budget
    ///
    /// Clears timestamps, response and tokens and sets `retry_count = 0`.
    /// Returns the number of rows reset.
    pub async fn reset_failed_requests(&self, job_id: JobId) -> Result<u64> {
        self.reset_requests_where(job_id, Some(RequestStatus::Failed))
            .await
    }

    /// Reset every request of a job to a fresh pending state
    pub async fn reset_all_requests(&self, job_id: JobId) -> Result<u64> {
        self.reset_requests_where(job_id, None).await
    }

    async fn reset_requests_where(
        &self,
        job_id: JobId,
        status: Option<RequestStatus>,
    ) -> Result<u64> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            UPDATE requests
            SET status = 0, retry_count = 0, response_body = NULL, prompt_tokens = 0,
                completion_tokens = 0, total_tokens = 0, started_at = NULL, completed_at = NULL
            WHERE job_id = "#,
        );
        query_builder.push_bind(job_id);
        if let Some(status) = status {
            query_builder.push(" AND status = ");
            query_builder.push_bind(status.to_i32());
        }

        let result = query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to reset requests: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Force a job's non-terminal requests into a terminal status
    ///
    /// First, requests carrying a usable response are promoted to `success`
    /// (keeping their end time if set); then the remaining candidates become
    /// `failed`. In [`FinalizeMode::Conditional`] only requests that exhausted
    /// `max_attempts` or have no response are candidates, so requests still
    /// legitimately in flight are left alone. Both steps run in one transaction
    /// and a second call changes nothing.
    pub async fn finalize_requests(
        &self,
        job_id: JobId,
        mode: FinalizeMode,
    ) -> Result<FinalizeOutcome> {
        let now = chrono::Utc::now().timestamp_millis();
        let (eligible, max_attempts) = match mode {
            FinalizeMode::Conditional { max_attempts } => (
                "AND (retry_count >= ? OR response_body IS NULL OR response_body = '')",
                Some(max_attempts as i64),
            ),
            FinalizeMode::Unconditional => ("", None),
        };

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin finalize: {}",
                e
            )))
        })?;

        let promote = format!(
            r#"
            UPDATE requests
            SET status = ?, completed_at = COALESCE(completed_at, ?)
            WHERE job_id = ? AND {} AND {} {}
            "#,
            NON_TERMINAL, USABLE_RESPONSE, eligible
        );
        let mut query = sqlx::query(&promote)
            .bind(RequestStatus::Success.to_i32())
            .bind(now)
            .bind(job_id);
        if let Some(max_attempts) = max_attempts {
            query = query.bind(max_attempts);
        }
        let succeeded = query
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to finalize successful requests: {}",
                    e
                )))
            })?
            .rows_affected();

        let fail = format!(
            r#"
            UPDATE requests
            SET status = ?, completed_at = ?
            WHERE job_id = ? AND {} {}
            "#,
            NON_TERMINAL, eligible
        );
        let mut query = sqlx::query(&fail)
            .bind(RequestStatus::Failed.to_i32())
            .bind(now)
            .bind(job_id);
        if let Some(max_attempts) = max_attempts {
            query = query.bind(max_attempts);
        }
        let failed = query
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to finalize failed requests: {}",
                    e
                )))
            })?
            .rows_affected();

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit finalize: {}",
                e
            )))
        })?;

        if succeeded > 0 {
            tracing::info!(
                job_id = %job_id,
                succeeded,
                "Finalize promoted requests with response data to success"
            );
        }

        Ok(FinalizeOutcome { succeeded, failed })
    }

    async fn begin_bulk(&self, batch: &str) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin {} batch: {}",
                batch, e
            )))
        })
    }
}

async fn commit_bulk(tx: sqlx::Transaction<'_, sqlx::Sqlite>, batch: &str) -> Result<()> {
    tx.commit().await.map_err(|e| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Failed to commit {} batch: {}",
            batch, e
        )))
    })
}
