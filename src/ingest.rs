//! Job file ingestion
//!
//! A job file is a JSON array whose items are chat payloads:
//!
//! ```json
//! [
//!   [{"role": "system", "content": "You are terse."}, {"role": "user", "content": "Hi"}],
//!   [{"role": "user", "content": "What is 2 + 2?"}]
//! ]
//! ```
//!
//! Every item is validated before anything is written, so a malformed file never
//! produces a half-created job.

use crate::config::JobsConfig;
use crate::db::{Database, NewJob};
use crate::error::{Error, Result};
use crate::types::{ChatMessage, EndpointId, JobId};
use serde_json::Value;

/// Parameters for a new job; omitted limits fall back to [`JobsConfig`] defaults
#[derive(Debug, Clone)]
pub struct NewJobSpec {
    /// Display name
    pub name: String,
    /// Reference to the file the requests came from
    pub source_file: String,
    /// Endpoint the job runs against (must exist and be active)
    pub endpoint_id: EndpointId,
    /// Maximum simultaneous in-flight requests
    pub concurrency: Option<u32>,
    /// Total tries per request, including the first
    pub max_attempts: Option<u32>,
}

/// Parse and validate a job file
///
/// Returns one message list per item, in file order. Fails with
/// [`Error::InvalidInput`] naming the first offending item.
pub fn parse_job_file(bytes: &[u8]) -> Result<Vec<Vec<ChatMessage>>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::InvalidInput(format!("job file is not valid JSON: {}", e)))?;

    let Value::Array(items) = value else {
        return Err(Error::InvalidInput(
            "job file must be a JSON array of message lists".into(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| parse_item(index, item))
        .collect()
}

fn parse_item(index: usize, item: Value) -> Result<Vec<ChatMessage>> {
    let Value::Array(entries) = item else {
        return Err(Error::InvalidInput(format!(
            "item {} must be a list of messages",
            index
        )));
    };
    if entries.is_empty() {
        return Err(Error::InvalidInput(format!("item {} has no messages", index)));
    }

    entries
        .into_iter()
        .enumerate()
        .map(|(position, entry)| {
            let message: ChatMessage = serde_json::from_value(entry).map_err(|e| {
                Error::InvalidInput(format!(
                    "item {} message {} is not a {{role, content}} object: {}",
                    index, position, e
                ))
            })?;
            if message.role.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "item {} message {} has an empty role",
                    index, position
                )));
            }
            Ok(message)
        })
        .collect()
}

/// Create a pending job with one request per item
///
/// Concurrency and attempts are clamped to `[1, max_concurrency]` and
/// `[1, max_attempts_cap]`. The job and all its requests are inserted in one
/// transaction.
pub async fn create_job(
    db: &Database,
    spec: NewJobSpec,
    items: &[Vec<ChatMessage>],
    limits: &JobsConfig,
) -> Result<JobId> {
    if spec.name.trim().is_empty() {
        return Err(Error::InvalidInput("job name must not be empty".into()));
    }
    if let Some(index) = items.iter().position(Vec::is_empty) {
        return Err(Error::InvalidInput(format!("item {} has no messages", index)));
    }

    let endpoint = db
        .get_endpoint(spec.endpoint_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("endpoint {}", spec.endpoint_id)))?;
    if !endpoint.is_active {
        return Err(Error::InvalidInput(format!(
            "endpoint '{}' is not active",
            endpoint.alias
        )));
    }

    let concurrency = spec
        .concurrency
        .unwrap_or(limits.default_concurrency)
        .clamp(1, limits.max_concurrency.max(1));
    let max_attempts = spec
        .max_attempts
        .unwrap_or(limits.default_max_attempts)
        .clamp(1, limits.max_attempts_cap.max(1));

    let job = NewJob {
        name: spec.name,
        source_file: spec.source_file,
        endpoint_id: spec.endpoint_id,
        concurrency,
        max_attempts,
    };
    let job_id = db.insert_job_with_requests(&job, items).await?;

    tracing::info!(
        job_id = %job_id,
        name = %job.name,
        endpoint = %endpoint.alias,
        requests = items.len(),
        concurrency,
        max_attempts,
        "Job created"
    );

    Ok(job_id)
}
