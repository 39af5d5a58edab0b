//! Append-only error log.

use crate::error::DatabaseError;
use crate::types::{ErrorKind, JobId, RequestId};
use crate::{Error, Result};

use super::{Database, ErrorLogEntry, ErrorLogRow};

impl Database {
    /// Append an error log entry
    pub async fn log_error(
        &self,
        job_id: JobId,
        request_id: Option<RequestId>,
        kind: ErrorKind,
        message: &str,
        details: Option<&str>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO error_logs (job_id, request_id, kind, message, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(request_id)
        .bind(kind.as_str())
        .bind(message)
        .bind(details)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to log error: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// List a job's error log, oldest first
    pub async fn list_errors_for_job(&self, job_id: JobId) -> Result<Vec<ErrorLogEntry>> {
        let rows = sqlx::query_as::<_, ErrorLogRow>(
            r#"
            SELECT id, job_id, request_id, kind, message, details, created_at
            FROM error_logs
            WHERE job_id = ?
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list errors for job: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(ErrorLogEntry::from).collect())
    }
}
