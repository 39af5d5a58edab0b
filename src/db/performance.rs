//! Performance snapshot persistence (one row per job).

use crate::error::DatabaseError;
use crate::types::JobId;
use crate::{Error, Result};

use super::{Database, PerformanceSnapshot};

impl Database {
    /// Insert or replace a job's performance snapshot
    pub async fn upsert_performance(
        &self,
        job_id: JobId,
        avg_response_time_secs: f64,
        total_processing_time_secs: f64,
        requests_per_second: f64,
        total_cost: f64,
        pricing_info: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO performance_stats (
                job_id, avg_response_time_secs, total_processing_time_secs,
                requests_per_second, total_cost, pricing_info, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                avg_response_time_secs = excluded.avg_response_time_secs,
                total_processing_time_secs = excluded.total_processing_time_secs,
                requests_per_second = excluded.requests_per_second,
                total_cost = excluded.total_cost,
                pricing_info = excluded.pricing_info,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id)
        .bind(avg_response_time_secs)
        .bind(total_processing_time_secs)
        .bind(requests_per_second)
        .bind(total_cost)
        .bind(pricing_info)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert performance snapshot: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Get a job's performance snapshot
    pub async fn get_performance(&self, job_id: JobId) -> Result<Option<PerformanceSnapshot>> {
        sqlx::query_as::<_, PerformanceSnapshot>(
            r#"
            SELECT job_id, avg_response_time_secs, total_processing_time_secs,
                   requests_per_second, total_cost, pricing_info, updated_at
            FROM performance_stats
            WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get performance snapshot: {}",
                e
            )))
        })
    }
}
