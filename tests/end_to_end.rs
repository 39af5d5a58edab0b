//! End-to-end tests: a runner with the real HTTP client against a wiremock upstream
//!
//! These tests cover whole jobs from file ingestion to terminal status:
//! - Concurrency-limited success with cost accounting
//! - Rate limiting that exhausts every attempt
//! - Partial failure and unexpected responses
//! - Recovery of a job interrupted by a crash
//!
//! # Running the tests
//!
//! ```bash
//! cargo test --test end_to_end
//! ```

mod common;

use common::{
    MIXED_JOB_FILE, WaitResult, add_mock_endpoint, assert_request_counts, completion_body,
    create_runner, error_body, job_spec, numbered_job_file, open_runner, wait_for_finish,
    wait_until_idle,
};
use llm_batch::{ErrorKind, Event, JobStatus, PricingInfo, RequestStatus};
use serde_json::Value;
use std::time::Duration;
use tokio_test::assert_ok;
use wiremock::matchers::{bearer_token, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn job_file_runs_to_completion_with_costs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(bearer_token("sk-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("ok", 1000, 500))
                .set_delay(Duration::from_millis(20)),
        )
        .expect(3)
        .mount(&server)
        .await;

    let (runner, _temp_dir) = create_runner().await;
    let endpoint_id = add_mock_endpoint(&runner, &server).await;
    let job_id = assert_ok!(
        runner
            .create_job_from_file(job_spec(endpoint_id, 2, 3), MIXED_JOB_FILE.as_bytes())
            .await
    );

    let mut events = runner.subscribe();
    assert_ok!(runner.start().await);

    let result = wait_for_finish(&mut events, job_id, WAIT).await;
    assert_eq!(
        result,
        WaitResult::Finished {
            status: JobStatus::Completed,
            success: 3,
            failed: 0
        }
    );
    assert_request_counts(&runner, job_id, 3, 0).await;

    // The upstream sees the endpoint's model and the stored messages
    let received = server.received_requests().await.expect("recording enabled");
    let bodies: Vec<Value> = received
        .iter()
        .map(|r| serde_json::from_slice(&r.body).expect("json body"))
        .collect();
    assert!(bodies.iter().all(|b| b["model"] == "mock-model"));
    assert!(
        bodies
            .iter()
            .any(|b| b["messages"][0]["content"] == "Answer in one word.")
    );

    wait_until_idle(&runner, job_id).await;
    let snapshot = runner
        .db()
        .get_performance(job_id)
        .await
        .expect("query")
        .expect("snapshot written at finish");
    // 3 × (1000/1000 × 1.0 + 500/1000 × 2.0)
    assert!((snapshot.total_cost - 6.0).abs() < 1e-9);
    let pricing: PricingInfo = serde_json::from_str(&snapshot.pricing_info).expect("pricing json");
    assert_eq!(pricing.successful_requests, 3);
    assert_eq!(pricing.total_tokens, 4500);

    let exported = assert_ok!(runner.export_results(job_id).await);
    assert_eq!(exported.len(), 3);
    assert_eq!(exported[1].messages[1].content, "Capital of France?");

    assert_ok!(runner.shutdown().await);
}

#[tokio::test]
async fn rate_limited_job_exhausts_attempts_and_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(error_body("Rate limit reached", "requests")),
        )
        .expect(9)
        .mount(&server)
        .await;

    let (runner, _temp_dir) = create_runner().await;
    let endpoint_id = add_mock_endpoint(&runner, &server).await;
    let job_id = assert_ok!(
        runner
            .create_job_from_file(job_spec(endpoint_id, 3, 3), &numbered_job_file(3))
            .await
    );

    let mut events = runner.subscribe();
    assert_ok!(runner.start().await);

    let result = wait_for_finish(&mut events, job_id, WAIT).await;
    assert_eq!(
        result,
        WaitResult::Finished {
            status: JobStatus::Failed,
            success: 0,
            failed: 3
        }
    );

    let requests = assert_ok!(runner.db().list_requests_for_job(job_id, None).await);
    for request in &requests {
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.retry_count, 3);
        assert!(request.completed_at.is_some());
    }

    let errors = assert_ok!(runner.db().list_errors_for_job(job_id).await);
    let rate_limits: Vec<_> = errors
        .iter()
        .filter(|e| e.kind == ErrorKind::RateLimit)
        .collect();
    assert_eq!(rate_limits.len(), 9);
    assert!(
        rate_limits[0]
            .details
            .as_deref()
            .is_some_and(|d| d.contains("Rate limit reached"))
    );

    assert_ok!(runner.shutdown().await);
}

#[tokio::test]
async fn one_failing_request_does_not_fail_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("question 1\""))
        .respond_with(ResponseTemplate::new(500).set_body_json(error_body("boom", "server_error")))
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("fine", 5, 5)))
        .expect(3)
        .mount(&server)
        .await;

    let (runner, _temp_dir) = create_runner().await;
    let endpoint_id = add_mock_endpoint(&runner, &server).await;
    let job_id = assert_ok!(
        runner
            .create_job_from_file(job_spec(endpoint_id, 2, 2), &numbered_job_file(4))
            .await
    );

    let mut events = runner.subscribe();
    assert_ok!(runner.start().await);

    let result = wait_for_finish(&mut events, job_id, WAIT).await;
    assert_eq!(
        result,
        WaitResult::Finished {
            status: JobStatus::Completed,
            success: 3,
            failed: 1
        }
    );
    assert_request_counts(&runner, job_id, 3, 1).await;

    let errors = assert_ok!(runner.db().list_errors_for_job(job_id).await);
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.kind == ErrorKind::ApiError));

    let exported = assert_ok!(runner.export_results(job_id).await);
    let indexes: Vec<i64> = exported.iter().map(|r| r.request_index).collect();
    assert_eq!(indexes, vec![0, 2, 3]);

    assert_ok!(runner.shutdown().await);
}

#[tokio::test]
async fn unexpected_response_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .expect(2)
        .mount(&server)
        .await;

    let (runner, _temp_dir) = create_runner().await;
    let endpoint_id = add_mock_endpoint(&runner, &server).await;
    let job_id = assert_ok!(
        runner
            .create_job_from_file(job_spec(endpoint_id, 1, 5), &numbered_job_file(2))
            .await
    );

    let mut events = runner.subscribe();
    assert_ok!(runner.start().await);

    let result = wait_for_finish(&mut events, job_id, WAIT).await;
    assert_eq!(
        result,
        WaitResult::Finished {
            status: JobStatus::Failed,
            success: 0,
            failed: 2
        }
    );

    let errors = assert_ok!(runner.db().list_errors_for_job(job_id).await);
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.kind == ErrorKind::InvalidResponse));

    assert_ok!(runner.shutdown().await);
}

#[tokio::test]
async fn crashed_job_is_recovered_by_next_runner() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("later", 3, 3)))
        .expect(4)
        .mount(&server)
        .await;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let job_id = {
        // A runner that dies mid-job: the job is left processing, never shut down
        let crashed = open_runner(temp_dir.path()).await;
        let endpoint_id = add_mock_endpoint(&crashed, &server).await;
        let job_id = assert_ok!(
            crashed
                .create_job_from_file(job_spec(endpoint_id, 2, 2), &numbered_job_file(4))
                .await
        );
        assert_ok!(
            crashed
                .db()
                .set_job_status(job_id, JobStatus::Processing, Some(1), None)
                .await
        );
        job_id
    };

    let runner = open_runner(temp_dir.path()).await;
    let mut events = runner.subscribe();
    assert_ok!(runner.start().await);

    let recovered = loop {
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Ok(Event::JobsRecovered { count })) => break count,
            Ok(Ok(_)) => continue,
            other => panic!("no recovery event: {:?}", other),
        }
    };
    assert_eq!(recovered, 1);

    let result = wait_for_finish(&mut events, job_id, WAIT).await;
    assert_eq!(
        result,
        WaitResult::Finished {
            status: JobStatus::Completed,
            success: 4,
            failed: 0
        }
    );

    assert_ok!(runner.shutdown().await);
    assert!(!assert_ok!(runner.db().was_unclean_shutdown().await));
}
