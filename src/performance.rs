//! Performance and cost accounting for a job

use crate::db::{Database, Endpoint, Request};
use crate::error::Result;
use crate::types::{ErrorKind, JobId, RequestStatus};
use serde::{Deserialize, Serialize};

/// Cost breakdown stored as JSON in `performance_stats.pricing_info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingInfo {
    /// Endpoint billing mode
    pub billing_mode: String,
    /// Currency the costs are expressed in
    pub currency: String,
    /// Model name
    pub model: String,
    /// Prompt tokens over successful requests
    pub prompt_tokens: i64,
    /// Completion tokens over successful requests
    pub completion_tokens: i64,
    /// Total tokens over successful requests
    pub total_tokens: i64,
    /// Cost of the prompt tokens
    pub prompt_cost: f64,
    /// Cost of the completion tokens
    pub completion_cost: f64,
    /// Requests in the job
    pub total_requests: i64,
    /// Successful requests
    pub successful_requests: i64,
}

/// Computed performance figures for one job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceReport {
    /// Mean `completed_at - started_at` over successful requests, in seconds
    pub avg_response_time_secs: f64,
    /// Span from the earliest start to the latest end, in seconds
    pub total_processing_time_secs: f64,
    /// Successful requests per second over that span
    pub requests_per_second: f64,
    /// Prompt plus completion cost
    pub total_cost: f64,
    /// Cost breakdown
    pub pricing: PricingInfo,
}

impl PerformanceReport {
    /// Compute the report from a job's requests
    ///
    /// Only `success` requests contribute. Requests without both timestamps
    /// count toward tokens and cost but not toward timing.
    pub fn compute(requests: &[Request], endpoint: Option<&Endpoint>) -> Self {
        let successes: Vec<&Request> = requests
            .iter()
            .filter(|r| r.status == RequestStatus::Success)
            .collect();

        let mut pricing = PricingInfo {
            total_requests: requests.len() as i64,
            successful_requests: successes.len() as i64,
            ..PricingInfo::default()
        };
        if let Some(endpoint) = endpoint {
            pricing.billing_mode = endpoint.billing_mode.clone();
            pricing.currency = endpoint.currency.clone();
            pricing.model = endpoint.model_name.clone();
        }

        if successes.is_empty() {
            return Self {
                pricing,
                ..Self::default()
            };
        }

        let spans: Vec<(i64, i64)> = successes
            .iter()
            .filter_map(|r| Some((r.started_at?, r.completed_at?)))
            .collect();
        let avg_response_time_secs = if spans.is_empty() {
            0.0
        } else {
            let sum_ms: i64 = spans.iter().map(|(s, e)| (e - s).max(0)).sum();
            sum_ms as f64 / spans.len() as f64 / 1000.0
        };
        let total_processing_time_secs = match (
            spans.iter().map(|(s, _)| *s).min(),
            spans.iter().map(|(_, e)| *e).max(),
        ) {
            (Some(first), Some(last)) => (last - first).max(0) as f64 / 1000.0,
            _ => 0.0,
        };
        let requests_per_second = if total_processing_time_secs > 0.0 {
            successes.len() as f64 / total_processing_time_secs
        } else {
            0.0
        };

        pricing.prompt_tokens = successes.iter().map(|r| r.prompt_tokens).sum();
        pricing.completion_tokens = successes.iter().map(|r| r.completion_tokens).sum();
        pricing.total_tokens = successes.iter().map(|r| r.total_tokens).sum();
        if let Some(endpoint) = endpoint {
            pricing.prompt_cost =
                pricing.prompt_tokens as f64 / 1000.0 * endpoint.prompt_price_per_1k;
            pricing.completion_cost =
                pricing.completion_tokens as f64 / 1000.0 * endpoint.completion_price_per_1k;
        }

        Self {
            avg_response_time_secs,
            total_processing_time_secs,
            requests_per_second,
            total_cost: pricing.prompt_cost + pricing.completion_cost,
            pricing,
        }
    }
}

/// Recompute and store a job's performance snapshot
pub async fn update_performance(db: &Database, job_id: JobId) -> Result<PerformanceReport> {
    let requests = db.list_requests_for_job(job_id, None).await?;
    let endpoint = match db.get_job(job_id).await? {
        Some(job) => db.get_endpoint(job.endpoint_id).await?,
        None => None,
    };

    let report = PerformanceReport::compute(&requests, endpoint.as_ref());
    let pricing_info = serde_json::to_string(&report.pricing)?;
    db.upsert_performance(
        job_id,
        report.avg_response_time_secs,
        report.total_processing_time_secs,
        report.requests_per_second,
        report.total_cost,
        &pricing_info,
    )
    .await?;

    tracing::debug!(
        job_id = %job_id,
        rps = report.requests_per_second,
        total_cost = report.total_cost,
        "Performance snapshot updated"
    );
    Ok(report)
}

/// [`update_performance`] that never fails
///
/// A failure is logged and recorded in the job's error log as
/// `performance_calculation`. Returns whether the snapshot was written.
pub async fn record_performance(db: &Database, job_id: JobId) -> bool {
    match update_performance(db, job_id).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Performance calculation failed");
            if let Err(log_err) = db
                .log_error(
                    job_id,
                    None,
                    ErrorKind::PerformanceCalculation,
                    &format!("Performance calculation failed: {}", e),
                    None,
                )
                .await
            {
                tracing::debug!(job_id = %job_id, error = %log_err, "Could not record performance failure");
            }
            false
        }
    }
}
