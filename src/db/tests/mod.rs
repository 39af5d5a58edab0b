use crate::config::EndpointDefaults;
use crate::db::*;
use crate::types::{ChatMessage, EndpointId, JobId};
use tempfile::NamedTempFile;


/// Open a fresh database backed by a temp file (keep the file alive for the test)
async fn open_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

async fn insert_test_endpoint(db: &Database, alias: &str) -> EndpointId {
    let endpoint = NewEndpoint::with_defaults(
        alias,
        "sk-test",
        "http://localhost:8000/v1",
        "test-model",
        &EndpointDefaults::default(),
    );
    db.insert_endpoint(&endpoint).await.unwrap()
}

fn items(count: usize) -> Vec<Vec<ChatMessage>> {
    (0..count)
        .map(|i| vec![ChatMessage::new("user", format!("question {}", i))])
        .collect()
}

/// Insert an endpoint plus a job with `count` pending requests
async fn insert_test_job(db: &Database, count: usize, max_attempts: u32) -> JobId {
    let endpoint_id = insert_test_endpoint(db, &format!("ep-{}", rand_suffix())).await;
    let job = NewJob {
        name: "Test Job".to_string(),
        source_file: "batch.json".to_string(),
        endpoint_id,
        concurrency: 2,
        max_attempts,
    };
    db.insert_job_with_requests(&job, &items(count)).await.unwrap()
}

fn rand_suffix() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..u64::MAX)
}
