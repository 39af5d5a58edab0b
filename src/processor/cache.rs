//! Write-back request cache
//!
//! While a job runs, its [`RequestCache`] is the authoritative view of every
//! request it owns. Executors mutate records in memory; [`RequestCache::flush`]
//! writes the dirty ones back in three bulk batches (success, failure and
//! in-flight). A failed flush keeps its records dirty so the next flush retries
//! them.

use crate::config::CacheConfig;
use crate::db::{Database, Request};
use crate::error::Result;
use crate::types::{JobId, RequestId, RequestStatus};
use crate::upstream::ChatCompletion;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// Destination of the cache's bulk writes
///
/// Implemented by [`Database`]; tests substitute writers that fail on demand.
#[async_trait]
pub trait RequestWriter: Send + Sync {
    /// Persist answered requests (status, response, tokens, attempts, timestamps)
    async fn write_success(&self, requests: &[Request]) -> Result<()>;
    /// Persist failed requests (status, attempts, start and end time)
    async fn write_failure(&self, requests: &[Request]) -> Result<()>;
    /// Persist pending, processing and retrying requests (status, attempts, timestamps)
    async fn write_in_flight(&self, requests: &[Request]) -> Result<()>;
}

#[async_trait]
impl RequestWriter for Database {
    async fn write_success(&self, requests: &[Request]) -> Result<()> {
        self.bulk_update_success(requests).await
    }

    async fn write_failure(&self, requests: &[Request]) -> Result<()> {
        self.bulk_update_failure(requests).await
    }

    async fn write_in_flight(&self, requests: &[Request]) -> Result<()> {
        self.bulk_update_in_flight(requests).await
    }
}

struct CacheState {
    requests: HashMap<RequestId, Request>,
    dirty: HashSet<RequestId>,
    last_flush: Instant,
}

/// In-memory view of one job's requests with batched write-back
pub struct RequestCache {
    job_id: JobId,
    writer: Arc<dyn RequestWriter>,
    batch_size: usize,
    flush_interval: Duration,
    state: Mutex<CacheState>,
    // Serializes flushes so two writers never interleave their batches
    flush_lock: Mutex<()>,
    flush_needed: Notify,
}

impl RequestCache {
    /// Load every request of `job_id` from the store
    pub async fn load(
        db: &Database,
        job_id: JobId,
        writer: Arc<dyn RequestWriter>,
        config: &CacheConfig,
    ) -> Result<Self> {
        let requests = db.list_requests_for_job(job_id, None).await?;
        tracing::debug!(job_id = %job_id, count = requests.len(), "Request cache loaded");
        Ok(Self::from_requests(job_id, requests, writer, config))
    }

    /// Build a cache over already-loaded requests
    pub fn from_requests(
        job_id: JobId,
        requests: Vec<Request>,
        writer: Arc<dyn RequestWriter>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            job_id,
            writer,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            state: Mutex::new(CacheState {
                requests: requests.into_iter().map(|r| (r.id, r)).collect(),
                dirty: HashSet::new(),
                last_flush: Instant::now(),
            }),
            flush_lock: Mutex::new(()),
            flush_needed: Notify::new(),
        }
    }

    /// Job the cache belongs to
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// All requests currently `pending`, ordered by `request_index`
    pub async fn pending_requests(&self) -> Vec<Request> {
        let state = self.state.lock().await;
        let mut pending: Vec<Request> = state
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.request_index);
        pending
    }

    /// Current in-memory state of one request
    pub async fn get(&self, id: RequestId) -> Option<Request> {
        self.state.lock().await.requests.get(&id).cloned()
    }

    /// Number of requests in the cache
    pub async fn len(&self) -> usize {
        self.state.lock().await.requests.len()
    }

    /// Whether the cache holds no requests
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of requests not yet written back
    pub async fn dirty_count(&self) -> usize {
        self.state.lock().await.dirty.len()
    }

    /// Set a request's status, stamping its start time when given
    pub async fn mark_status(&self, id: RequestId, status: RequestStatus, started_at: Option<i64>) {
        self.update(id, |request| {
            request.status = status;
            if started_at.is_some() {
                request.started_at = started_at;
            }
        })
        .await;
    }

    /// Record an answered request
    pub async fn mark_success(&self, id: RequestId, completion: ChatCompletion, completed_at: i64) {
        self.update(id, |request| {
            request.status = RequestStatus::Success;
            request.response_body = Some(completion.raw_body);
            request.prompt_tokens = completion.prompt_tokens;
            request.completion_tokens = completion.completion_tokens;
            request.total_tokens = completion.total_tokens;
            request.completed_at = Some(completed_at);
        })
        .await;
    }

    /// Record a failed attempt
    ///
    /// `status` is `Retrying` while attempts remain and `Failed` once they are
    /// exhausted (or the error is not worth retrying).
    pub async fn mark_failed(
        &self,
        id: RequestId,
        completed_at: i64,
        retry_count: u32,
        status: RequestStatus,
    ) {
        self.update(id, |request| {
            request.status = status;
            request.retry_count = retry_count;
            request.completed_at = Some(completed_at);
        })
        .await;
    }

    async fn update(&self, id: RequestId, apply: impl FnOnce(&mut Request)) {
        let dirty = {
            let mut state = self.state.lock().await;
            let Some(request) = state.requests.get_mut(&id) else {
                tracing::warn!(job_id = %self.job_id, request_id = %id, "Update for request not in cache");
                return;
            };
            apply(request);
            state.dirty.insert(id);
            state.dirty.len()
        };

        if dirty >= self.batch_size {
            self.flush_needed.notify_one();
        }
    }

    /// Resolves once the dirty set has reached the batch threshold
    pub async fn batch_ready(&self) {
        self.flush_needed.notified().await;
    }

    /// Write dirty requests back to the store
    ///
    /// No-op while nothing is dirty. Otherwise writes when `force` is set, the
    /// dirty set reached the batch size, or the flush interval elapsed since the
    /// last successful flush. Returns the number of requests written.
    ///
    /// On a write error every id of the attempted flush is marked dirty again and
    /// the last-flush time is left alone, so nothing is dropped.
    pub async fn flush(&self, force: bool) -> Result<usize> {
        let _flushing = self.flush_lock.lock().await;

        let (ids, success, failure, in_flight) = {
            let mut state = self.state.lock().await;
            if state.dirty.is_empty() {
                return Ok(0);
            }
            let due = force
                || state.dirty.len() >= self.batch_size
                || state.last_flush.elapsed() >= self.flush_interval;
            if !due {
                return Ok(0);
            }

            let ids: Vec<RequestId> = state.dirty.drain().collect();
            let mut success = Vec::new();
            let mut failure = Vec::new();
            let mut in_flight = Vec::new();
            for id in &ids {
                let Some(request) = state.requests.get(id) else {
                    continue;
                };
                match request.status {
                    RequestStatus::Success => success.push(request.clone()),
                    RequestStatus::Failed => failure.push(request.clone()),
                    RequestStatus::Pending
                    | RequestStatus::Processing
                    | RequestStatus::Retrying => in_flight.push(request.clone()),
                }
            }
            (ids, success, failure, in_flight)
        };

        match self.write_batches(&success, &failure, &in_flight).await {
            Ok(()) => {
                self.state.lock().await.last_flush = Instant::now();
                tracing::debug!(
                    job_id = %self.job_id,
                    success = success.len(),
                    failed = failure.len(),
                    in_flight = in_flight.len(),
                    "Flushed request cache"
                );
                Ok(ids.len())
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.dirty.extend(ids.iter().copied());
                tracing::warn!(
                    job_id = %self.job_id,
                    dirty = state.dirty.len(),
                    error = %e,
                    "Request cache flush failed, will retry"
                );
                Err(e)
            }
        }
    }

    async fn write_batches(
        &self,
        success: &[Request],
        failure: &[Request],
        in_flight: &[Request],
    ) -> Result<()> {
        if !success.is_empty() {
            self.writer.write_success(success).await?;
        }
        if !failure.is_empty() {
            self.writer.write_failure(failure).await?;
        }
        if !in_flight.is_empty() {
            self.writer.write_in_flight(in_flight).await?;
        }
        Ok(())
    }
}
