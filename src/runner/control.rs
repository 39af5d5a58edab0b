//! Job creation and control operations.

use crate::db::{Job, NewEndpoint};
use crate::error::{Error, Result};
use crate::ingest::{self, NewJobSpec};
use crate::types::{ChatMessage, EndpointId, Event, JobId, JobStatus, RequestStatus};
use serde::{Deserialize, Serialize};

use super::BatchRunner;

/// One answered request of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedResult {
    /// Position in the source file
    pub request_index: i64,
    /// The chat payload that was sent
    pub messages: Vec<ChatMessage>,
    /// Upstream response, parsed as JSON (a string if it was not valid JSON)
    pub response_body: serde_json::Value,
}

impl BatchRunner {
    /// Register an API endpoint
    pub async fn add_endpoint(&self, endpoint: NewEndpoint) -> Result<EndpointId> {
        let id = self.ctx.db.insert_endpoint(&endpoint).await?;
        tracing::info!(endpoint_id = %id, alias = %endpoint.alias, "Endpoint added");
        Ok(id)
    }

    /// Create a pending job from already-parsed chat payloads
    pub async fn create_job(&self, spec: NewJobSpec, items: &[Vec<ChatMessage>]) -> Result<JobId> {
        let name = spec.name.clone();
        let id = ingest::create_job(&self.ctx.db, spec, items, &self.ctx.config.jobs).await?;
        tracing::info!(job_id = %id, name = %name, requests = items.len(), "Job created");
        Ok(id)
    }

    /// Create a pending job from the raw bytes of a job file
    pub async fn create_job_from_file(&self, spec: NewJobSpec, bytes: &[u8]) -> Result<JobId> {
        let items = ingest::parse_job_file(bytes)?;
        self.create_job(spec, &items).await
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.ctx
            .db
            .get_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }

    /// Pause a pending or processing job
    ///
    /// A live processor notices within `pause_check_interval`: its in-flight
    /// requests finish, nothing new is started. Pausing a paused job is a no-op.
    pub async fn pause_job(&self, id: JobId) -> Result<()> {
        let job = self.get_job(id).await?;
        match job.status {
            JobStatus::Paused => {
                tracing::debug!(job_id = %id, "Job already paused");
                return Ok(());
            }
            JobStatus::Pending | JobStatus::Processing => {}
            status => {
                return Err(Error::InvalidState(format!(
                    "cannot pause job {} in status {}",
                    id, status
                )));
            }
        }

        let paused = self
            .ctx
            .db
            .transition_job_status(
                id,
                &[JobStatus::Pending, JobStatus::Processing],
                JobStatus::Paused,
            )
            .await?;
        if !paused {
            return Err(Error::InvalidState(format!(
                "job {} changed status while pausing",
                id
            )));
        }

        tracing::info!(job_id = %id, "Job paused");
        self.ctx.emit(Event::JobPaused { id });
        Ok(())
    }

    /// Resume a paused job
    ///
    /// Requests caught mid-attempt go back to `pending` (keeping their attempt
    /// count) and the job becomes `pending` again. A processor that is still
    /// live simply continues; otherwise the scheduler relaunches the job.
    pub async fn resume_job(&self, id: JobId) -> Result<()> {
        let job = self.get_job(id).await?;
        if job.status != JobStatus::Paused {
            return Err(Error::InvalidState(format!(
                "cannot resume job {} in status {}",
                id, job.status
            )));
        }

        let requeued = self.ctx.db.requeue_in_flight_requests(id).await?;
        let resumed = self
            .ctx
            .db
            .transition_job_status(id, &[JobStatus::Paused], JobStatus::Pending)
            .await?;
        if !resumed {
            return Err(Error::InvalidState(format!(
                "job {} changed status while resuming",
                id
            )));
        }

        tracing::info!(job_id = %id, requeued, "Job resumed");
        self.ctx.emit(Event::JobResumed { id });
        Ok(())
    }

    /// Give a job's failed requests a fresh attempt budget and requeue the job
    ///
    /// If no request had failed, stranded `processing`/`retrying` requests are
    /// requeued instead. Returns the number of requests reset.
    pub async fn retry_failed_requests(&self, id: JobId) -> Result<u64> {
        self.get_job(id).await?;
        self.ensure_not_live(id, "retry").await?;

        let db = &self.ctx.db;
        let mut reset = db.reset_failed_requests(id).await?;
        if reset == 0 {
            reset = db.requeue_in_flight_requests(id).await?;
        }

        let counts = db.get_status_counts(id).await?;
        db.set_job_stats(id, counts.success, counts.failed).await?;
        db.set_job_status(id, JobStatus::Pending, None, None).await?;

        tracing::info!(job_id = %id, reset, "Failed requests requeued");
        Ok(reset)
    }

    /// Reset every request of a job to a fresh pending state
    pub async fn reset_job(&self, id: JobId) -> Result<()> {
        self.get_job(id).await?;
        self.ensure_not_live(id, "reset").await?;

        let db = &self.ctx.db;
        let reset = db.reset_all_requests(id).await?;
        db.reset_job_stats(id).await?;
        db.set_job_status(id, JobStatus::Pending, None, None).await?;

        tracing::info!(job_id = %id, reset, "Job reset");
        Ok(())
    }

    /// Delete a job with its requests, error logs and performance snapshot
    ///
    /// A live processor is stopped without writing anything further.
    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        if !self.ctx.db.delete_job(id).await? {
            return Err(Error::NotFound(format!("job {}", id)));
        }

        if let Some(token) = self.ctx.live_jobs.lock().await.get(&id) {
            tracing::debug!(job_id = %id, "Stopping live processor of deleted job");
            token.cancel();
        }

        tracing::info!(job_id = %id, "Job deleted");
        self.ctx.emit(Event::JobDeleted { id });
        Ok(())
    }

    /// Successful requests of a job, ordered by `request_index`
    pub async fn export_results(&self, id: JobId) -> Result<Vec<ExportedResult>> {
        self.get_job(id).await?;
        let requests = self
            .ctx
            .db
            .list_requests_for_job(id, Some(RequestStatus::Success))
            .await?;

        Ok(requests
            .into_iter()
            .map(|request| {
                let raw = request.response_body.unwrap_or_default();
                let response_body =
                    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
                ExportedResult {
                    request_index: request.request_index,
                    messages: request.messages,
                    response_body,
                }
            })
            .collect())
    }

    /// [`BatchRunner::export_results`] as a pretty-printed JSON array
    pub async fn export_results_json(&self, id: JobId) -> Result<String> {
        let results = self.export_results(id).await?;
        Ok(serde_json::to_string_pretty(&results)?)
    }

    async fn ensure_not_live(&self, id: JobId, operation: &str) -> Result<()> {
        if self.is_live(id).await {
            return Err(Error::InvalidState(format!(
                "cannot {} job {} while it is running",
                operation, id
            )));
        }
        Ok(())
    }
}
