//! Job files and upstream response bodies

use llm_batch::{EndpointId, NewJobSpec};
use serde_json::{Value, json};

/// Job file with a system prompt on the second item
pub const MIXED_JOB_FILE: &str = r#"[
  [{"role": "user", "content": "What is 2 + 2?"}],
  [{"role": "system", "content": "Answer in one word."}, {"role": "user", "content": "Capital of France?"}],
  [{"role": "user", "content": "Name a prime number."}]
]"#;

/// Job file of `count` single-message items ("question 0", "question 1", ...)
pub fn numbered_job_file(count: usize) -> Vec<u8> {
    let items: Vec<Value> = (0..count)
        .map(|i| json!([{"role": "user", "content": format!("question {}", i)}]))
        .collect();
    serde_json::to_vec(&items).expect("job file serializes")
}

/// OpenAI-style completion body
pub fn completion_body(content: &str, prompt_tokens: i64, completion_tokens: i64) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "mock-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

/// OpenAI-style error body
pub fn error_body(message: &str, kind: &str) -> Value {
    json!({"error": {"message": message, "type": kind}})
}

/// Job options with explicit limits
pub fn job_spec(endpoint_id: EndpointId, concurrency: u32, max_attempts: u32) -> NewJobSpec {
    NewJobSpec {
        name: "integration batch".to_string(),
        source_file: "batch.json".to_string(),
        endpoint_id,
        concurrency: Some(concurrency),
        max_attempts: Some(max_attempts),
    }
}
