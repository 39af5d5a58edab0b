use super::*;
use crate::db::NewEndpoint;
use crate::error::{Error, UpstreamError};
use crate::ingest::NewJobSpec;
use crate::processor::test_helpers::{ScriptedClient, completion, fast_config};
use crate::types::{ChatMessage, EndpointId, JobStatus, RequestStatus};
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

async fn create_runner(path: &Path, client: Arc<ScriptedClient>) -> BatchRunner {
    let mut config = fast_config();
    config.persistence.database_path = path.to_path_buf();
    config.shutdown_timeout = Duration::from_secs(5);
    BatchRunner::new(config, client).await.unwrap()
}

async fn add_endpoint(runner: &BatchRunner) -> EndpointId {
    let defaults = runner.config().endpoint_defaults.clone();
    runner
        .add_endpoint(NewEndpoint::with_defaults(
            "primary",
            "sk-test",
            "http://127.0.0.1:9/v1",
            "test-model",
            &defaults,
        ))
        .await
        .unwrap()
}

fn job_spec(endpoint_id: EndpointId, concurrency: u32, max_attempts: u32) -> NewJobSpec {
    NewJobSpec {
        name: "nightly batch".into(),
        source_file: "batch.json".into(),
        endpoint_id,
        concurrency: Some(concurrency),
        max_attempts: Some(max_attempts),
    }
}

fn items(count: usize) -> Vec<Vec<ChatMessage>> {
    (0..count)
        .map(|i| vec![ChatMessage::new("user", format!("question {}", i))])
        .collect()
}

async fn wait_for_status(runner: &BatchRunner, id: JobId, status: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = runner.get_job(id).await.unwrap();
        if job.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {} waiting for {status}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_live(runner: &BatchRunner, id: JobId, live: bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while runner.is_live(id).await != live {
        assert!(tokio::time::Instant::now() < deadline, "job {id} live != {live}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn runner_completes_job_and_exports_results_in_order() {
    let file = NamedTempFile::new().unwrap();
    let client = Arc::new(ScriptedClient::new(|_, messages| {
        Ok(completion(&format!("re: {}", messages[0].content), 8, 4))
    }));
    let runner = create_runner(file.path(), client.clone()).await;
    let endpoint_id = add_endpoint(&runner).await;
    let mut events = runner.subscribe();

    let job_id = runner
        .create_job_from_file(
            job_spec(endpoint_id, 3, 2),
            br#"[
                [{"role": "user", "content": "first"}],
                [{"role": "system", "content": "be brief"}, {"role": "user", "content": "second"}],
                [{"role": "user", "content": "third"}]
            ]"#,
        )
        .await
        .unwrap();

    runner.start().await.unwrap();
    wait_for_status(&runner, job_id, JobStatus::Completed).await;

    let results = runner.export_results(job_id).await.unwrap();
    let indexes: Vec<i64> = results.iter().map(|r| r.request_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(results[1].messages.len(), 2);
    assert_eq!(
        results[2].response_body["choices"][0]["message"]["content"],
        "re: third"
    );

    let json = runner.export_results_json(job_id).await.unwrap();
    let parsed: Vec<ExportedResult> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, results);

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let Event::JobFinished {
            id,
            status,
            success,
            failed,
        } = event
        {
            finished = Some((id, status, success, failed));
        }
    }
    assert_eq!(finished, Some((job_id, JobStatus::Completed, 3, 0)));
    assert_eq!(client.calls(), 3);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_job_file_creates_nothing() {
    let file = NamedTempFile::new().unwrap();
    let runner = create_runner(file.path(), Arc::new(ScriptedClient::always_ok())).await;
    let endpoint_id = add_endpoint(&runner).await;

    let result = runner
        .create_job_from_file(
            job_spec(endpoint_id, 1, 1),
            br#"[[{"role": "user", "content": "ok"}], []]"#,
        )
        .await;

    assert!(matches!(result, Err(Error::InvalidInput(_))));
    assert!(runner.db().list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn pause_and_resume_follow_status_rules() {
    let file = NamedTempFile::new().unwrap();
    let runner = create_runner(file.path(), Arc::new(ScriptedClient::always_ok())).await;
    let endpoint_id = add_endpoint(&runner).await;
    let job_id = runner
        .create_job(job_spec(endpoint_id, 1, 1), &items(2))
        .await
        .unwrap();
    let mut events = runner.subscribe();

    assert!(matches!(
        runner.resume_job(job_id).await,
        Err(Error::InvalidState(_))
    ));

    runner.pause_job(job_id).await.unwrap();
    assert_eq!(runner.get_job(job_id).await.unwrap().status, JobStatus::Paused);
    // pausing twice is a no-op
    runner.pause_job(job_id).await.unwrap();

    runner.resume_job(job_id).await.unwrap();
    assert_eq!(runner.get_job(job_id).await.unwrap().status, JobStatus::Pending);

    assert!(matches!(events.try_recv(), Ok(Event::JobPaused { id }) if id == job_id));
    assert!(matches!(events.try_recv(), Ok(Event::JobResumed { id }) if id == job_id));
    assert!(events.try_recv().is_err());

    runner
        .db()
        .set_job_status(job_id, JobStatus::Completed, None, None)
        .await
        .unwrap();
    assert!(matches!(
        runner.pause_job(job_id).await,
        Err(Error::InvalidState(_))
    ));

    let missing = JobId::new(9999);
    assert!(matches!(runner.pause_job(missing).await, Err(Error::NotFound(_))));
    assert!(matches!(runner.resume_job(missing).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn paused_job_is_not_picked_up_until_resumed() {
    let file = NamedTempFile::new().unwrap();
    let client = Arc::new(ScriptedClient::always_ok());
    let runner = create_runner(file.path(), client.clone()).await;
    let endpoint_id = add_endpoint(&runner).await;
    let job_id = runner
        .create_job(job_spec(endpoint_id, 2, 1), &items(4))
        .await
        .unwrap();

    runner.pause_job(job_id).await.unwrap();
    runner.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client.calls(), 0);
    assert!(!runner.is_live(job_id).await);

    runner.resume_job(job_id).await.unwrap();
    wait_for_status(&runner, job_id, JobStatus::Completed).await;
    assert_eq!(client.calls(), 4);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_failed_requests_reruns_only_failures() {
    let file = NamedTempFile::new().unwrap();
    // Odd-numbered questions fail on the first pass only
    let client = Arc::new(ScriptedClient::new(|call, messages| {
        let odd = messages[0].content.ends_with('1') || messages[0].content.ends_with('3');
        if odd && call < 4 {
            Err(UpstreamError::InvalidResponse("truncated body".into()))
        } else {
            Ok(completion("answer", 10, 5))
        }
    }));
    let runner = create_runner(file.path(), client.clone()).await;
    let endpoint_id = add_endpoint(&runner).await;
    let job_id = runner
        .create_job(job_spec(endpoint_id, 1, 3), &items(4))
        .await
        .unwrap();

    runner.start().await.unwrap();
    wait_for_status(&runner, job_id, JobStatus::Completed).await;
    wait_until_live(&runner, job_id, false).await;

    let job = runner.get_job(job_id).await.unwrap();
    assert_eq!((job.success_count, job.failed_count), (2, 2));

    let reset = runner.retry_failed_requests(job_id).await.unwrap();
    assert_eq!(reset, 2);

    // Scheduler picks the job up again
    wait_for_status(&runner, job_id, JobStatus::Completed).await;

    let job = runner.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!((job.success_count, job.failed_count), (4, 0));
    assert_eq!(client.calls(), 6);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn reset_job_clears_every_request() {
    let file = NamedTempFile::new().unwrap();
    let client = Arc::new(ScriptedClient::always_ok());
    let runner = create_runner(file.path(), client.clone()).await;
    let endpoint_id = add_endpoint(&runner).await;
    let job_id = runner
        .create_job(job_spec(endpoint_id, 2, 1), &items(3))
        .await
        .unwrap();

    runner.start().await.unwrap();
    wait_for_status(&runner, job_id, JobStatus::Completed).await;
    wait_until_live(&runner, job_id, false).await;
    runner.shutdown().await.unwrap();

    runner.reset_job(job_id).await.unwrap();

    let job = runner.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!((job.success_count, job.failed_count), (0, 0));
    assert!(job.started_at.is_none() && job.completed_at.is_none());

    for request in runner.db().list_requests_for_job(job_id, None).await.unwrap() {
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.retry_count, 0);
        assert!(request.response_body.is_none());
        assert_eq!(request.total_tokens, 0);
    }
}

#[tokio::test]
async fn live_job_refuses_reset_and_can_be_deleted() {
    let file = NamedTempFile::new().unwrap();
    let client = Arc::new(ScriptedClient::always_ok().with_delay(Duration::from_millis(200)));
    let runner = create_runner(file.path(), client.clone()).await;
    let endpoint_id = add_endpoint(&runner).await;
    let job_id = runner
        .create_job(job_spec(endpoint_id, 1, 1), &items(10))
        .await
        .unwrap();
    let mut events = runner.subscribe();

    runner.start().await.unwrap();
    wait_until_live(&runner, job_id, true).await;

    assert!(matches!(
        runner.reset_job(job_id).await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        runner.retry_failed_requests(job_id).await,
        Err(Error::InvalidState(_))
    ));

    runner.delete_job(job_id).await.unwrap();
    wait_until_live(&runner, job_id, false).await;

    assert!(matches!(runner.get_job(job_id).await, Err(Error::NotFound(_))));
    assert!(
        runner
            .db()
            .list_requests_for_job(job_id, None)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(matches!(runner.delete_job(job_id).await, Err(Error::NotFound(_))));

    let mut saw_deleted = false;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, Event::JobFinished { .. }));
        saw_deleted |= matches!(event, Event::JobDeleted { id } if id == job_id);
    }
    assert!(saw_deleted);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_leaves_job_for_recovery_by_next_runner() {
    let file = NamedTempFile::new().unwrap();
    let slow = Arc::new(ScriptedClient::always_ok().with_delay(Duration::from_millis(100)));
    let runner = create_runner(file.path(), slow.clone()).await;
    let endpoint_id = add_endpoint(&runner).await;
    let job_id = runner
        .create_job(job_spec(endpoint_id, 1, 2), &items(20))
        .await
        .unwrap();

    runner.start().await.unwrap();
    wait_until_live(&runner, job_id, true).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    runner.shutdown().await.unwrap();

    assert!(runner.live_jobs().await.is_empty());
    let job = runner.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    let counts = runner.db().get_status_counts(job_id).await.unwrap();
    assert!(counts.success >= 1, "answered requests are flushed on shutdown");
    assert!(counts.success < 20);
    assert!(!runner.db().was_unclean_shutdown().await.unwrap());
    assert!(matches!(runner.start().await, Err(Error::ShuttingDown)));
    drop(runner);

    let fast = Arc::new(ScriptedClient::always_ok());
    let restarted = create_runner(file.path(), fast.clone()).await;
    restarted.start().await.unwrap();
    wait_for_status(&restarted, job_id, JobStatus::Completed).await;

    let job = restarted.get_job(job_id).await.unwrap();
    assert_eq!((job.success_count, job.failed_count), (20, 0));
    assert_eq!(fast.calls() as i64, 20 - counts.success);

    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_is_idempotent() {
    let file = NamedTempFile::new().unwrap();
    let runner = create_runner(file.path(), Arc::new(ScriptedClient::always_ok())).await;

    runner.start().await.unwrap();
    runner.start().await.unwrap();
    runner.clone().start().await.unwrap();

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let file = NamedTempFile::new().unwrap();
    let mut config = fast_config();
    config.persistence.database_path = file.path().to_path_buf();
    config.cache.batch_size = 0;

    let result = BatchRunner::new(config, Arc::new(ScriptedClient::always_ok())).await;
    assert!(matches!(result, Err(Error::Config { .. })));
}
