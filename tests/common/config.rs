//! Runner construction against a mock upstream

use llm_batch::{BatchRunner, Config, EndpointId, NewEndpoint};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

/// Config with millisecond timings and the database inside `dir`
pub fn fast_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("batch.db");
    config.scheduler.poll_interval = Duration::from_millis(20);
    config.scheduler.recovery_interval = Duration::from_millis(500);
    config.scheduler.error_retry_interval = Duration::from_millis(50);
    config.processor.pause_check_interval = Duration::from_millis(10);
    config.processor.deletion_check_interval = Duration::from_millis(10);
    config.processor.performance_update_interval = Duration::from_millis(50);
    config.cache.flush_interval = Duration::from_millis(20);
    config.retry.backoff_unit = Duration::from_millis(1);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Runner using the real HTTP client, with its database in a fresh temp dir
pub async fn create_runner() -> (BatchRunner, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let runner = open_runner(temp_dir.path()).await;
    (runner, temp_dir)
}

/// Runner using the real HTTP client over the database in `dir`
pub async fn open_runner(dir: &Path) -> BatchRunner {
    BatchRunner::with_default_client(fast_config(dir))
        .await
        .expect("Failed to create runner")
}

/// Register an endpoint pointing at the mock server's `/v1`
pub async fn add_mock_endpoint(runner: &BatchRunner, server: &MockServer) -> EndpointId {
    let mut endpoint = NewEndpoint::with_defaults(
        "mock",
        "sk-test",
        format!("{}/v1", server.uri()),
        "mock-model",
        &runner.config().endpoint_defaults,
    );
    endpoint.timeout_secs = 5;
    endpoint.prompt_price_per_1k = 1.0;
    endpoint.completion_price_per_1k = 2.0;
    runner
        .add_endpoint(endpoint)
        .await
        .expect("Failed to add endpoint")
}
