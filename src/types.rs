//! Core types shared across the engine: identifiers, statuses and events.

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wrap a raw database id
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl PartialEq<i64> for $name {
            fn eq(&self, other: &i64) -> bool {
                self.0 == *other
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

id_newtype!(
    /// Unique identifier for a batch job
    JobId
);
id_newtype!(
    /// Unique identifier for a single request within a job
    RequestId
);
id_newtype!(
    /// Unique identifier for an upstream endpoint configuration
    EndpointId
);

/// Job status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up by the scheduler
    Pending,
    /// A job processor is running it
    Processing,
    /// Every request reached a terminal status
    Completed,
    /// Finished without every request accounted for, or misconfigured
    Failed,
    /// Paused by the operator; executors wait before their next attempt
    Paused,
}

impl JobStatus {
    /// Convert integer status code to JobStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => JobStatus::Pending,
            1 => JobStatus::Processing,
            2 => JobStatus::Completed,
            3 => JobStatus::Failed,
            4 => JobStatus::Paused,
            _ => JobStatus::Failed, // Unknown codes surface as failed
        }
    }

    /// Convert JobStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Paused => 4,
        }
    }

    /// Completed and failed jobs are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Lowercase name, as used in logs and exports
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Not attempted yet (or requeued)
    Pending,
    /// First attempt in flight
    Processing,
    /// Answered by the upstream endpoint
    Success,
    /// Attempts exhausted or unexpected error
    Failed,
    /// A later attempt in flight or waiting for backoff
    Retrying,
}

impl RequestStatus {
    /// Convert integer status code to RequestStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => RequestStatus::Pending,
            1 => RequestStatus::Processing,
            2 => RequestStatus::Success,
            3 => RequestStatus::Failed,
            4 => RequestStatus::Retrying,
            _ => RequestStatus::Failed,
        }
    }

    /// Convert RequestStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Processing => 1,
            RequestStatus::Success => 2,
            RequestStatus::Failed => 3,
            RequestStatus::Retrying => 4,
        }
    }

    /// Success and failed requests are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Success | RequestStatus::Failed)
    }

    /// Lowercase name, as used in logs and exports
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Success => "success",
            RequestStatus::Failed => "failed",
            RequestStatus::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification stored in the error log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Generic upstream API failure (non-success status)
    ApiError,
    /// Upstream call timed out
    Timeout,
    /// Upstream rejected the call with 429
    RateLimit,
    /// Connection-level failure talking to the upstream
    Transport,
    /// Upstream answered with something that is not a chat completion
    InvalidResponse,
    /// Unexpected failure inside the engine
    SystemError,
    /// Missing or inactive endpoint configuration
    Configuration,
    /// Performance snapshot could not be computed
    PerformanceCalculation,
}

impl ErrorKind {
    /// Stable name stored in the `error_logs.kind` column
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ApiError => "api_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Transport => "transport",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::SystemError => "system_error",
            ErrorKind::Configuration => "configuration",
            ErrorKind::PerformanceCalculation => "performance_calculation",
        }
    }

    /// Parse a stored kind, falling back to [`ErrorKind::SystemError`]
    pub fn parse(kind: &str) -> Self {
        match kind {
            "api_error" => ErrorKind::ApiError,
            "timeout" => ErrorKind::Timeout,
            "rate_limit" => ErrorKind::RateLimit,
            "transport" => ErrorKind::Transport,
            "invalid_response" => ErrorKind::InvalidResponse,
            "configuration" => ErrorKind::Configuration,
            "performance_calculation" => ErrorKind::PerformanceCalculation,
            _ => ErrorKind::SystemError,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role/content pair of a chat-completion payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role ("system", "user", "assistant", ...)
    pub role: String,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a message
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Event emitted during the job lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job processor took the job
    JobStarted {
        /// Job ID
        id: JobId,
        /// Number of requests still pending when the job started
        pending: usize,
    },

    /// A job reached a terminal status
    JobFinished {
        /// Job ID
        id: JobId,
        /// Terminal status
        status: JobStatus,
        /// Number of successful requests
        success: i64,
        /// Number of failed requests
        failed: i64,
    },

    /// A job was paused
    JobPaused {
        /// Job ID
        id: JobId,
    },

    /// A paused job was set back to pending
    JobResumed {
        /// Job ID
        id: JobId,
    },

    /// A job was deleted (possibly mid-run)
    JobDeleted {
        /// Job ID
        id: JobId,
    },

    /// The recovery sweep requeued interrupted jobs
    JobsRecovered {
        /// Number of jobs reset to pending
        count: usize,
    },
}
