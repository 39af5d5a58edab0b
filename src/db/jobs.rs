//! Job creation, status transitions and statistics.

use crate::error::DatabaseError;
use crate::types::{ChatMessage, EndpointId, JobId, JobStatus, RequestStatus};
use crate::{Error, Result};
use std::collections::HashMap;

use super::{Database, Endpoint, Job, JobRow, NewJob, SQLITE_MAX_VARIABLES};

const JOB_COLUMNS: &str = r#"
    id, name, source_file, endpoint_id, total_requests, status, concurrency, max_attempts,
    success_count, failed_count, created_at, started_at, completed_at
"#;

impl Database {
    /// Insert a job and all of its requests in one transaction
    ///
    /// Requests get `request_index` equal to their position in `items`. The job
    /// starts `pending` with `total_requests = items.len()`, so it only becomes
    /// visible to the scheduler once every request row exists.
    pub async fn insert_job_with_requests(
        &self,
        job: &NewJob,
        items: &[Vec<ChatMessage>],
    ) -> Result<JobId> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = items
            .iter()
            .enumerate()
            .map(|(index, messages)| Ok((index as i64, serde_json::to_string(messages)?)))
            .collect::<Result<Vec<(i64, String)>>>()?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin job insert: {}",
                e
            )))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                name, source_file, endpoint_id, total_requests, status, concurrency,
                max_attempts, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.name)
        .bind(&job.source_file)
        .bind(job.endpoint_id)
        .bind(items.len() as i64)
        .bind(JobStatus::Pending.to_i32())
        .bind(job.concurrency as i64)
        .bind(job.max_attempts as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert job: {}",
                e
            )))
        })?;
        let job_id = JobId(result.last_insert_rowid());

        // 4 bind variables per request
        const BINDS_PER_ROW: usize = 4;
        for chunk in rows.chunks(SQLITE_MAX_VARIABLES / BINDS_PER_ROW) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO requests (job_id, request_index, messages, status) ",
            );
            query_builder.push_values(chunk, |mut b, (index, messages)| {
                b.push_bind(job_id)
                    .push_bind(*index)
                    .push_bind(messages)
                    .push_bind(RequestStatus::Pending.to_i32());
            });

            query_builder.build().execute(&mut *tx).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert requests batch: {}",
                    e
                )))
            })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit job insert: {}",
                e
            )))
        })?;

        Ok(job_id)
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let query = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get job: {}",
                    e
                )))
            })?;

        Ok(row.map(Job::from))
    }

    /// List all jobs, newest first
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let query = format!("SELECT {} FROM jobs ORDER BY created_at DESC, id DESC", JOB_COLUMNS);
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list jobs: {}",
                    e
                )))
            })?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    /// List jobs with the given status, oldest first
    pub async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {} FROM jobs WHERE status = ? ORDER BY created_at ASC, id ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(status.to_i32())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list jobs by status: {}",
                    e
                )))
            })?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    /// List pending jobs together with their endpoint configuration
    ///
    /// The endpoint is `None` when the job references an endpoint that no longer
    /// exists; the job processor turns that into a configuration failure.
    pub async fn list_pending_jobs_with_endpoint(&self) -> Result<Vec<(Job, Option<Endpoint>)>> {
        let jobs = self.list_jobs_by_status(JobStatus::Pending).await?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let endpoints: HashMap<EndpointId, Endpoint> = self
            .list_endpoints()
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        Ok(jobs
            .into_iter()
            .map(|job| {
                let endpoint = endpoints.get(&job.endpoint_id).cloned();
                (job, endpoint)
            })
            .collect())
    }

    /// List jobs marked completed that still own non-terminal requests
    ///
    /// These are left behind by a crash between request finalization and the
    /// job status write.
    pub async fn list_completed_jobs_with_open_requests(&self) -> Result<Vec<Job>> {
        let query = format!(
            r#"
            SELECT {} FROM jobs j
            WHERE j.status = ?
              AND EXISTS (
                SELECT 1 FROM requests r
                WHERE r.job_id = j.id AND r.status IN (?, ?, ?)
              )
            ORDER BY j.id
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(JobStatus::Completed.to_i32())
            .bind(RequestStatus::Pending.to_i32())
            .bind(RequestStatus::Processing.to_i32())
            .bind(RequestStatus::Retrying.to_i32())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list completed jobs with open requests: {}",
                    e
                )))
            })?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    /// Set a job's status, optionally stamping its start and/or end time
    ///
    /// Timestamps that are `None` keep their stored value. Returns `false` if the
    /// job does not exist.
    pub async fn set_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        started_at: Option<i64>,
        completed_at: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            "#,
        )
        .bind(status.to_i32())
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set job status: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a job to `to` only if its current status is one of `from`
    ///
    /// Returns `true` if the transition happened.
    pub async fn transition_job_status(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let mut query_builder = sqlx::QueryBuilder::new("UPDATE jobs SET status = ");
        query_builder.push_bind(to.to_i32());
        query_builder.push(" WHERE id = ");
        query_builder.push_bind(id);
        query_builder.push(" AND status IN (");
        let mut separated = query_builder.separated(", ");
        for status in from {
            separated.push_bind(status.to_i32());
        }
        separated.push_unseparated(")");

        let result = query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to transition job status: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Claim a pending job for processing, stamping its start time
    ///
    /// Returns `false` if the job is missing or no longer `pending` (paused or
    /// deleted after it was listed).
    pub async fn start_pending_job(&self, id: JobId, started_at: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, started_at = ? WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Processing.to_i32())
        .bind(started_at)
        .bind(id)
        .bind(JobStatus::Pending.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to start job: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Correct a job's stored request total
    pub async fn set_job_total_requests(&self, id: JobId, total: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET total_requests = ? WHERE id = ?")
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set job total requests: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Write a job's success/failure counters
    pub async fn set_job_stats(&self, id: JobId, success: i64, failed: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET success_count = ?, failed_count = ? WHERE id = ?")
            .bind(success)
            .bind(failed)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set job stats: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Clear a job's counters and timestamps
    pub async fn reset_job_stats(&self, id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET success_count = 0, failed_count = 0, started_at = NULL, completed_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reset job stats: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Delete a job (requests, error logs and performance snapshot cascade)
    pub async fn delete_job(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete job: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
