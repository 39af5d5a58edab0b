//! # llm-batch
//!
//! Crash-recoverable batch execution engine for chat-completion API requests.
//!
//! A job is a list of chat payloads sent to one configured endpoint. The engine
//! runs every pending job on its own task, keeps at most `concurrency` requests
//! of a job in flight, retries transient upstream failures with exponential
//! backoff, batches result writes to SQLite and decides each job's terminal
//! status once all of its requests are accounted for.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Crash-recoverable** - Interrupted jobs are requeued by a periodic recovery sweep
//! - **Event-driven** - Consumers subscribe to lifecycle events
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_batch::{BatchRunner, Config, NewEndpoint, NewJobSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let runner = BatchRunner::with_default_client(config).await?;
//!
//!     let endpoint_id = runner
//!         .add_endpoint(NewEndpoint::with_defaults(
//!             "openai",
//!             "sk-...",
//!             "https://api.openai.com/v1",
//!             "gpt-4o-mini",
//!             &runner.config().endpoint_defaults,
//!         ))
//!         .await?;
//!
//!     let job_file = std::fs::read("questions.json")?;
//!     let job_id = runner
//!         .create_job_from_file(
//!             NewJobSpec {
//!                 name: "questions".to_string(),
//!                 source_file: "questions.json".to_string(),
//!                 endpoint_id,
//!                 concurrency: Some(10),
//!                 max_attempts: None,
//!             },
//!             &job_file,
//!         )
//!         .await?;
//!
//!     // Subscribe to events
//!     let mut events = runner.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     runner.start().await?;
//!     println!("Running job {}", job_id);
//!
//!     llm_batch::run_with_shutdown(runner).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Job file parsing and job creation
pub mod ingest;
/// Performance statistics per job
pub mod performance;
/// Job execution engine (cache, executor, job processor, scheduler)
pub mod processor;
/// Retry classification and exponential backoff
pub mod retry;
/// Process-owner facade: lifecycle and job control
pub mod runner;
/// Core types and events
pub mod types;
/// Upstream chat-completion client
pub mod upstream;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, Endpoint, Job, NewEndpoint, Request};
pub use error::{DatabaseError, Error, Result, UpstreamError};
pub use ingest::NewJobSpec;
pub use performance::{PerformanceReport, PricingInfo};
pub use processor::decide_job_status;
pub use runner::{BatchRunner, ExportedResult};
pub use types::{
    ChatMessage, EndpointId, ErrorKind, Event, JobId, JobStatus, RequestId, RequestStatus,
};
pub use upstream::{ChatClient, ChatCompletion, OpenAiCompatibleClient};

/// Run the engine until a termination signal arrives, then shut it down.
///
/// Call [`BatchRunner::start`] first; this only waits and stops.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use llm_batch::{BatchRunner, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runner = BatchRunner::with_default_client(Config::default()).await?;
///     runner.start().await?;
///
///     run_with_shutdown(runner).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(runner: BatchRunner) -> Result<()> {
    wait_for_signal().await;
    runner.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
    } else {
        tracing::info!("Received Ctrl+C signal");
    }
}
