//! Shared helpers for engine tests: a scripted upstream, a flaky writer and
//! millisecond-scale configuration.

use super::EngineContext;
use super::cache::RequestWriter;
use crate::config::{Config, EndpointDefaults};
use crate::db::{Database, NewEndpoint, NewJob, Request};
use crate::error::{DatabaseError, Error, Result, UpstreamError};
use crate::types::{ChatMessage, EndpointId, JobId, RequestId};
use crate::upstream::{ChatClient, ChatCompletion};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Open a fresh database in a temp file (keep the file alive for the test)
pub(crate) async fn open_db() -> (Arc<Database>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (Arc::new(db), temp_file)
}

/// Insert an active endpoint plus a job with `count` single-message requests
pub(crate) async fn insert_job(
    db: &Database,
    count: usize,
    concurrency: u32,
    max_attempts: u32,
) -> (JobId, EndpointId) {
    let alias = format!("test-{}", rand::random::<u32>());
    let endpoint_id = db
        .insert_endpoint(&NewEndpoint::with_defaults(
            alias,
            "sk-test",
            "http://127.0.0.1:9/v1",
            "test-model",
            &EndpointDefaults::default(),
        ))
        .await
        .unwrap();

    let items: Vec<Vec<ChatMessage>> = (0..count)
        .map(|i| vec![ChatMessage::new("user", format!("question {}", i))])
        .collect();
    let job_id = db
        .insert_job_with_requests(
            &NewJob {
                name: format!("job of {}", count),
                source_file: "test.json".into(),
                endpoint_id,
                concurrency,
                max_attempts,
            },
            &items,
        )
        .await
        .unwrap();

    (job_id, endpoint_id)
}

/// A successful completion with the given usage
pub(crate) fn completion(content: &str, prompt_tokens: i64, completion_tokens: i64) -> ChatCompletion {
    let body = serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    });
    ChatCompletion::from_body(body.to_string()).unwrap()
}

/// Config with millisecond intervals so engine tests finish quickly
pub(crate) fn fast_config() -> Config {
    let mut config = Config::default();
    config.scheduler.poll_interval = Duration::from_millis(20);
    config.scheduler.recovery_interval = Duration::from_millis(500);
    config.scheduler.error_retry_interval = Duration::from_millis(50);
    config.processor.pause_check_interval = Duration::from_millis(10);
    config.processor.deletion_check_interval = Duration::from_millis(10);
    config.processor.performance_update_interval = Duration::from_millis(50);
    config.cache.flush_interval = Duration::from_millis(20);
    config.retry.backoff_unit = Duration::from_millis(1);
    config
}

/// Engine context over `db` with the given upstream
pub(crate) fn engine_context(
    db: Arc<Database>,
    client: Arc<dyn ChatClient>,
    config: Config,
) -> EngineContext {
    let (event_tx, _rx) = tokio::sync::broadcast::channel(100);
    EngineContext {
        db: db.clone(),
        writer: db,
        client,
        config: Arc::new(config),
        event_tx,
        live_jobs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
    }
}

type Respond = dyn Fn(usize, &[ChatMessage]) -> std::result::Result<ChatCompletion, UpstreamError>
    + Send
    + Sync;

/// Upstream whose answers come from a closure of (call number, messages)
pub(crate) struct ScriptedClient {
    respond: Box<Respond>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub(crate) fn new(
        respond: impl Fn(usize, &[ChatMessage]) -> std::result::Result<ChatCompletion, UpstreamError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call succeeds with 10 prompt and 5 completion tokens
    pub(crate) fn always_ok() -> Self {
        Self::new(|_, _| Ok(completion("answer", 10, 5)))
    }

    /// Every call is rate limited
    pub(crate) fn always_rate_limited() -> Self {
        Self::new(|_, _| {
            Err(UpstreamError::RateLimited {
                message: "Rate limit reached".into(),
                body: Some(serde_json::json!({"error": {"message": "Rate limit reached"}})),
            })
        })
    }

    /// Hold every call for `delay` before answering
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn chat_completion(
        &self,
        _endpoint: &crate::db::Endpoint,
        messages: &[ChatMessage],
    ) -> std::result::Result<ChatCompletion, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.respond)(call, messages);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Writer that fails its first `failures` flushes, then delegates to the database
pub(crate) struct FlakyWriter {
    db: Arc<Database>,
    remaining_failures: AtomicUsize,
    written: Mutex<Vec<RequestId>>,
}

impl FlakyWriter {
    pub(crate) fn new(db: Arc<Database>, failures: usize) -> Self {
        Self {
            db,
            remaining_failures: AtomicUsize::new(failures),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Ids written by successful flushes
    pub(crate) fn written_ids(&self) -> Vec<RequestId> {
        self.written.lock().unwrap().clone()
    }

    fn check(&self, requests: &[Request]) -> Result<()> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Database(DatabaseError::QueryFailed(
                "injected write failure".into(),
            )));
        }
        self.written
            .lock()
            .unwrap()
            .extend(requests.iter().map(|r| r.id));
        Ok(())
    }
}

#[async_trait]
impl RequestWriter for FlakyWriter {
    async fn write_success(&self, requests: &[Request]) -> Result<()> {
        self.check(requests)?;
        self.db.bulk_update_success(requests).await
    }

    async fn write_failure(&self, requests: &[Request]) -> Result<()> {
        self.check(requests)?;
        self.db.bulk_update_failure(requests).await
    }

    async fn write_in_flight(&self, requests: &[Request]) -> Result<()> {
        self.check(requests)?;
        self.db.bulk_update_in_flight(requests).await
    }
}
