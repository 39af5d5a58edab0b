//! Job execution engine split into focused submodules.
//!
//! - [`cache`] - Write-back request cache (one per running job)
//! - [`executor`] - Per-request attempt/retry state machine
//! - [`job`] - One job's end-to-end lifecycle and finalization
//! - [`background_tasks`] - Periodic flush, performance and deletion watchdog tasks
//! - [`scheduler`] - Recovery sweep and pending-job polling loop

mod background_tasks;
pub mod cache;
mod executor;
mod job;
mod scheduler;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use cache::{RequestCache, RequestWriter};
pub use job::decide_job_status;
pub(crate) use job::JobProcessor;
pub(crate) use scheduler::Scheduler;

use crate::config::Config;
use crate::db::Database;
use crate::types::{Event, JobId};
use crate::upstream::ChatClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Jobs with a running processor, keyed to the token that stops it
pub(crate) type LiveJobs = Arc<tokio::sync::Mutex<HashMap<JobId, CancellationToken>>>;

/// Shared handles every engine component needs
#[derive(Clone)]
pub(crate) struct EngineContext {
    /// Store
    pub(crate) db: Arc<Database>,
    /// Where request caches write back (the store itself outside tests)
    pub(crate) writer: Arc<dyn RequestWriter>,
    /// Upstream chat-completion client
    pub(crate) client: Arc<dyn ChatClient>,
    /// Engine configuration
    pub(crate) config: Arc<Config>,
    /// Event broadcast sender
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Registry of running job processors
    pub(crate) live_jobs: LiveJobs,
}

impl EngineContext {
    /// Broadcast an event; having no subscribers is fine
    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
