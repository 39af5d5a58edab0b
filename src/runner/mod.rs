//! Process-owner facade over the engine.
//!
//! The [`BatchRunner`] struct and its methods are organized by domain:
//! - [`lifecycle`] - Start and graceful shutdown
//! - [`control`] - Job creation and control (pause/resume/retry/reset/delete/export)

mod control;
mod lifecycle;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use control::ExportedResult;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::processor::EngineContext;
use crate::types::{Event, JobId};
use crate::upstream::{ChatClient, OpenAiCompatibleClient};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffer size for the event broadcast channel
const EVENT_CHANNEL_BUFFER: usize = 1000;

/// Owns the store, the scheduler task and every live job processor
#[derive(Clone)]
pub struct BatchRunner {
    pub(crate) ctx: EngineContext,
    /// Stops the scheduler loop
    scheduler_token: CancellationToken,
    /// Scheduler task, present once started
    scheduler_handle: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl BatchRunner {
    /// Open the store and prepare the engine
    ///
    /// Validates `config`, runs migrations and records a clean start. Nothing
    /// is scheduled until [`BatchRunner::start`] is called.
    pub async fn new(config: Config, client: Arc<dyn ChatClient>) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.persistence.database_path).await?;
        match db.was_unclean_shutdown().await {
            Ok(true) => tracing::warn!(
                "Previous session did not shut down cleanly, interrupted jobs will be recovered"
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Could not read shutdown state"),
        }
        db.set_clean_start().await?;

        let (event_tx, _rx) = tokio::sync::broadcast::channel(EVENT_CHANNEL_BUFFER);
        let db = Arc::new(db);
        let ctx = EngineContext {
            db: db.clone(),
            writer: db,
            client,
            config: Arc::new(config),
            event_tx,
            live_jobs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        };

        Ok(Self {
            ctx,
            scheduler_token: CancellationToken::new(),
            scheduler_handle: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// [`BatchRunner::new`] with an [`OpenAiCompatibleClient`]
    pub async fn with_default_client(config: Config) -> Result<Self> {
        Self::new(config, Arc::new(OpenAiCompatibleClient::new())).await
    }

    /// The underlying store
    pub fn db(&self) -> &Database {
        &self.ctx.db
    }

    /// The engine configuration
    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Subscribe to job lifecycle events
    ///
    /// Multiple subscribers are supported; a slow subscriber only lags itself.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.ctx.event_tx.subscribe()
    }

    /// Whether `id` currently has a running processor
    pub async fn is_live(&self, id: JobId) -> bool {
        self.ctx.live_jobs.lock().await.contains_key(&id)
    }

    /// Ids of jobs with a running processor
    pub async fn live_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.ctx.live_jobs.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }
}
