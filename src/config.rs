//! Configuration types for llm-batch

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Main configuration
///
/// Every section has working defaults, so `Config::default()` runs out of the box
/// against a local `./llm-batch.db`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Scheduler polling and recovery timing
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Per-job processor timing
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Request cache write-back thresholds
    #[serde(default)]
    pub cache: CacheConfig,

    /// Backoff between request attempts
    #[serde(default)]
    pub retry: RetryConfig,

    /// Defaults and caps applied when jobs are created
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Defaults applied when endpoints are registered
    #[serde(default)]
    pub endpoint_defaults: EndpointDefaults,

    /// How long shutdown waits for running jobs to stop (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.batch_size == 0 {
            return Err(Error::config("cache.batch_size", "must be at least 1"));
        }
        if self.cache.flush_interval.is_zero() {
            return Err(Error::config("cache.flush_interval", "must be non-zero"));
        }

        let intervals = [
            ("scheduler.poll_interval", self.scheduler.poll_interval),
            ("scheduler.recovery_interval", self.scheduler.recovery_interval),
            (
                "scheduler.error_retry_interval",
                self.scheduler.error_retry_interval,
            ),
            (
                "processor.pause_check_interval",
                self.processor.pause_check_interval,
            ),
            (
                "processor.deletion_check_interval",
                self.processor.deletion_check_interval,
            ),
            (
                "processor.performance_update_interval",
                self.processor.performance_update_interval,
            ),
        ];
        for (key, interval) in intervals {
            if interval.is_zero() {
                return Err(Error::config(key, "must be non-zero"));
            }
        }

        if self.retry.backoff_base.is_nan() || self.retry.backoff_base < 1.0 {
            return Err(Error::config("retry.backoff_base", "must be at least 1.0"));
        }
        if self.jobs.max_concurrency == 0 {
            return Err(Error::config("jobs.max_concurrency", "must be at least 1"));
        }
        if self.jobs.max_attempts_cap == 0 {
            return Err(Error::config("jobs.max_attempts_cap", "must be at least 1"));
        }
        Ok(())
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./llm-batch.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Scheduler timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between polls for pending jobs (default: 5 seconds)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Time between recovery sweeps (default: 10 seconds)
    #[serde(default = "default_recovery_interval", with = "duration_ms_serde")]
    pub recovery_interval: Duration,

    /// Sleep after a failed loop iteration (default: 10 seconds)
    #[serde(default = "default_error_retry_interval", with = "duration_ms_serde")]
    pub error_retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            recovery_interval: default_recovery_interval(),
            error_retry_interval: default_error_retry_interval(),
        }
    }
}

/// Job processor timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// How often a waiting executor re-reads a paused job's status (default: 1 second)
    #[serde(default = "default_check_interval", with = "duration_ms_serde")]
    pub pause_check_interval: Duration,

    /// How often the deletion watchdog checks that the job still exists (default: 1 second)
    #[serde(default = "default_check_interval", with = "duration_ms_serde")]
    pub deletion_check_interval: Duration,

    /// How often the performance snapshot is recomputed mid-run (default: 10 seconds)
    #[serde(
        default = "default_performance_update_interval",
        with = "duration_ms_serde"
    )]
    pub performance_update_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            pause_check_interval: default_check_interval(),
            deletion_check_interval: default_check_interval(),
            performance_update_interval: default_performance_update_interval(),
        }
    }
}

/// Request cache write-back thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Dirty-record count that triggers a flush (default: 100)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between flushes while records are dirty (default: 5 seconds)
    #[serde(default = "default_flush_interval", with = "duration_ms_serde")]
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
        }
    }
}

/// Backoff between attempts of one request
///
/// The sleep before attempt `k + 1` is `backoff_unit * backoff_base^k`, optionally
/// jittered and capped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Exponential base (default: 2.0)
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Unit the power is multiplied with (default: 1 second)
    #[serde(default = "default_backoff_unit", with = "duration_ms_serde")]
    pub backoff_unit: Duration,

    /// Upper bound for a single backoff sleep (default: none)
    #[serde(default, with = "optional_duration_serde")]
    pub max_delay: Option<Duration>,

    /// Add random jitter to backoff sleeps (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base: default_backoff_base(),
            backoff_unit: default_backoff_unit(),
            max_delay: None,
            jitter: false,
        }
    }
}

/// Defaults and caps applied when a job is created
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Concurrency used when a job does not specify one (default: 5)
    #[serde(default = "default_concurrency")]
    pub default_concurrency: u32,

    /// Attempts per request when a job does not specify them (default: 3)
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Upper clamp for job concurrency (default: 200)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Upper clamp for attempts per request (default: 20)
    #[serde(default = "default_max_attempts_cap")]
    pub max_attempts_cap: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            default_max_attempts: default_max_attempts(),
            max_concurrency: default_max_concurrency(),
            max_attempts_cap: default_max_attempts_cap(),
        }
    }
}

/// Model parameters used when an endpoint is registered without them
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointDefaults {
    /// Completion token limit (default: 4096)
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature (default: 0.7)
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Per-call timeout (default: 60 seconds)
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Currency for cost accounting (default: "RMB")
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout: default_timeout(),
            currency: default_currency(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./llm-batch.db")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_recovery_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_error_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_performance_update_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_unit() -> Duration {
    Duration::from_secs(1)
}

fn default_concurrency() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_concurrency() -> u32 {
    200
}

fn default_max_attempts_cap() -> u32 {
    20
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_currency() -> String {
    "RMB".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for sub-second polling)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
