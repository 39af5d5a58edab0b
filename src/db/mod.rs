//! Database layer for llm-batch
//!
//! Handles SQLite persistence for endpoints, jobs, requests, error logs and
//! performance snapshots. Records are validated once here and handed to the
//! engine as typed structs.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`endpoints`] - Upstream endpoint configuration CRUD
//! - [`jobs`] - Job creation, status and statistics
//! - [`requests`] - Request listing, bulk write-back, resets and finalize
//! - [`error_logs`] - Append-only error log
//! - [`performance`] - Performance snapshot upsert
//! - [`state`] - Runtime state (shutdown tracking)

use crate::error::Error;
use crate::types::{
    ChatMessage, EndpointId, ErrorKind, JobId, JobStatus, RequestId, RequestStatus,
};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::time::Duration;

mod endpoints;
mod error_logs;
mod jobs;
mod migrations;
mod performance;
mod requests;
mod state;

/// SQLite allows 999 bind variables per statement by default
pub(crate) const SQLITE_MAX_VARIABLES: usize = 999;

/// New endpoint configuration to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    /// Unique human-readable alias
    pub alias: String,
    /// Bearer token sent to the endpoint
    pub api_key: String,
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub api_base: String,
    /// Model name sent with every request
    pub model_name: String,
    /// Completion token limit
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f64,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Currency used for cost accounting
    pub currency: String,
    /// Billing mode (only "token" is priced)
    pub billing_mode: String,
    /// Price per 1000 prompt tokens
    pub prompt_price_per_1k: f64,
    /// Price per 1000 completion tokens
    pub completion_price_per_1k: f64,
    /// Price per request (informational)
    pub request_price: f64,
    /// Price per second (informational)
    pub second_price: f64,
    /// Minimum billable unit (informational)
    pub minimum_billable_unit: i64,
    /// Free-form pricing notes
    pub pricing_notes: Option<String>,
    /// Whether jobs may run against this endpoint
    pub is_active: bool,
}

impl NewEndpoint {
    /// Build an active, zero-priced endpoint using the configured model defaults
    pub fn with_defaults(
        alias: impl Into<String>,
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        model_name: impl Into<String>,
        defaults: &crate::config::EndpointDefaults,
    ) -> Self {
        Self {
            alias: alias.into(),
            api_key: api_key.into(),
            api_base: api_base.into(),
            model_name: model_name.into(),
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            timeout_secs: defaults.timeout.as_secs(),
            currency: defaults.currency.clone(),
            billing_mode: "token".to_string(),
            prompt_price_per_1k: 0.0,
            completion_price_per_1k: 0.0,
            request_price: 0.0,
            second_price: 0.0,
            minimum_billable_unit: 1,
            pricing_notes: None,
            is_active: true,
        }
    }
}

/// Endpoint configuration record from database
#[derive(Debug, Clone, FromRow)]
pub struct Endpoint {
    /// Unique database ID
    pub id: EndpointId,
    /// Unique human-readable alias
    pub alias: String,
    /// Bearer token sent to the endpoint
    pub api_key: String,
    /// Base URL
    pub api_base: String,
    /// Model name sent with every request
    pub model_name: String,
    /// Completion token limit
    pub max_tokens: i64,
    /// Sampling temperature
    pub temperature: f64,
    /// Per-call timeout in seconds
    pub timeout_secs: i64,
    /// Currency used for cost accounting
    pub currency: String,
    /// Billing mode
    pub billing_mode: String,
    /// Price per 1000 prompt tokens
    pub prompt_price_per_1k: f64,
    /// Price per 1000 completion tokens
    pub completion_price_per_1k: f64,
    /// Price per request
    pub request_price: f64,
    /// Price per second
    pub second_price: f64,
    /// Minimum billable unit
    pub minimum_billable_unit: i64,
    /// Free-form pricing notes
    pub pricing_notes: Option<String>,
    /// Whether jobs may run against this endpoint
    pub is_active: bool,
    /// Unix timestamp (ms) when the endpoint was registered
    pub created_at: i64,
    /// Unix timestamp (ms) of the last update
    pub updated_at: i64,
}

impl Endpoint {
    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1) as u64)
    }
}

/// New job to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Display name
    pub name: String,
    /// Reference to the file the requests came from
    pub source_file: String,
    /// Endpoint the job runs against
    pub endpoint_id: EndpointId,
    /// Maximum simultaneous in-flight requests
    pub concurrency: u32,
    /// Total tries per request, including the first
    pub max_attempts: u32,
}

/// Job row from database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    id: i64,
    name: String,
    source_file: String,
    endpoint_id: i64,
    total_requests: i64,
    status: i32,
    concurrency: i64,
    max_attempts: i64,
    success_count: i64,
    failed_count: i64,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

/// A batch job
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Unique database ID
    pub id: JobId,
    /// Display name
    pub name: String,
    /// Reference to the file the requests came from
    pub source_file: String,
    /// Endpoint the job runs against
    pub endpoint_id: EndpointId,
    /// Number of requests (corrected at finalize if it drifts from the row count)
    pub total_requests: i64,
    /// Current status
    pub status: JobStatus,
    /// Maximum simultaneous in-flight requests (at least 1)
    pub concurrency: u32,
    /// Total tries per request, including the first (at least 1)
    pub max_attempts: u32,
    /// Successful requests, as of the last statistics write
    pub success_count: i64,
    /// Failed requests, as of the last statistics write
    pub failed_count: i64,
    /// Unix timestamp (ms) when the job was created
    pub created_at: i64,
    /// Unix timestamp (ms) when processing last started
    pub started_at: Option<i64>,
    /// Unix timestamp (ms) when the job reached a terminal status
    pub completed_at: Option<i64>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: JobId(row.id),
            name: row.name,
            source_file: row.source_file,
            endpoint_id: EndpointId(row.endpoint_id),
            total_requests: row.total_requests,
            status: JobStatus::from_i32(row.status),
            concurrency: row.concurrency.clamp(1, u32::MAX as i64) as u32,
            max_attempts: row.max_attempts.clamp(1, u32::MAX as i64) as u32,
            success_count: row.success_count,
            failed_count: row.failed_count,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

/// Request row from database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct RequestRow {
    id: i64,
    job_id: i64,
    request_index: i64,
    messages: String,
    status: i32,
    retry_count: i64,
    response_body: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

/// A single chat-completion request of a job
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Unique database ID
    pub id: RequestId,
    /// Owning job
    pub job_id: JobId,
    /// Position in the source file (unique per job)
    pub request_index: i64,
    /// Ordered chat payload
    pub messages: Vec<ChatMessage>,
    /// Current status
    pub status: RequestStatus,
    /// Attempts consumed so far
    pub retry_count: u32,
    /// Serialized upstream response, present once answered
    pub response_body: Option<String>,
    /// Prompt tokens reported by the upstream
    pub prompt_tokens: i64,
    /// Completion tokens reported by the upstream
    pub completion_tokens: i64,
    /// Prompt plus completion tokens
    pub total_tokens: i64,
    /// Unix timestamp (ms) when the latest attempt started
    pub started_at: Option<i64>,
    /// Unix timestamp (ms) when the latest attempt ended
    pub completed_at: Option<i64>,
}

impl Request {
    /// Whether the request carries a response that counts as a usable answer
    pub fn has_usable_response(&self) -> bool {
        self.response_body.as_deref().is_some_and(|b| !b.is_empty()) && self.total_tokens > 0
    }
}

impl TryFrom<RequestRow> for Request {
    type Error = Error;

    fn try_from(row: RequestRow) -> Result<Self, Self::Error> {
        let messages: Vec<ChatMessage> = serde_json::from_str(&row.messages)?;
        Ok(Self {
            id: RequestId(row.id),
            job_id: JobId(row.job_id),
            request_index: row.request_index,
            messages,
            status: RequestStatus::from_i32(row.status),
            retry_count: row.retry_count.max(0) as u32,
            response_body: row.response_body,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            total_tokens: row.total_tokens,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Per-status request counts for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Requests not attempted yet
    pub pending: i64,
    /// Requests in their first attempt
    pub processing: i64,
    /// Successful requests
    pub success: i64,
    /// Failed requests
    pub failed: i64,
    /// Requests in a later attempt
    pub retrying: i64,
}

impl StatusCounts {
    /// Sum over all statuses
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.success + self.failed + self.retrying
    }

    /// Requests that are not success or failed yet
    pub fn non_terminal(&self) -> i64 {
        self.pending + self.processing + self.retrying
    }
}

/// Strictness of a finalize pass over a job's non-terminal requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeMode {
    /// Only terminalize requests that exhausted their attempts or have no response
    Conditional {
        /// The job's attempt budget
        max_attempts: u32,
    },
    /// Terminalize every non-terminal request
    Unconditional,
}

/// Rows changed by a finalize pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// Requests promoted to success
    pub succeeded: u64,
    /// Requests marked failed
    pub failed: u64,
}

impl FinalizeOutcome {
    /// Total rows changed
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Error log row from database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ErrorLogRow {
    id: i64,
    job_id: i64,
    request_id: Option<i64>,
    kind: String,
    message: String,
    details: Option<String>,
    created_at: i64,
}

/// Append-only error log entry
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLogEntry {
    /// Unique database ID
    pub id: i64,
    /// Job the error belongs to
    pub job_id: JobId,
    /// Request the error belongs to, if any
    pub request_id: Option<RequestId>,
    /// Classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Structured details (usually the upstream error body as JSON)
    pub details: Option<String>,
    /// Unix timestamp (ms) when the error was logged
    pub created_at: i64,
}

impl From<ErrorLogRow> for ErrorLogEntry {
    fn from(row: ErrorLogRow) -> Self {
        Self {
            id: row.id,
            job_id: JobId(row.job_id),
            request_id: row.request_id.map(RequestId),
            kind: ErrorKind::parse(&row.kind),
            message: row.message,
            details: row.details,
            created_at: row.created_at,
        }
    }
}

/// Performance snapshot record from database (one per job)
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PerformanceSnapshot {
    /// Job the snapshot describes
    pub job_id: JobId,
    /// Mean duration of successful requests, in seconds
    pub avg_response_time_secs: f64,
    /// Wall-clock span from first start to last end of successful requests, in seconds
    pub total_processing_time_secs: f64,
    /// Successful requests per second over that span
    pub requests_per_second: f64,
    /// Prompt plus completion cost
    pub total_cost: f64,
    /// Pricing breakdown as JSON (see [`crate::performance::PricingInfo`])
    pub pricing_info: String,
    /// Unix timestamp (ms) of the last upsert
    pub updated_at: i64,
}

/// Database handle for llm-batch
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
