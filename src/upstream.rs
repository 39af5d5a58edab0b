//! Upstream chat-completion client
//!
//! The engine only sees the [`ChatClient`] trait: one call with a timeout and a
//! typed outcome. [`OpenAiCompatibleClient`] implements it for any endpoint that
//! speaks the OpenAI `/chat/completions` protocol.

use crate::db::Endpoint;
use crate::error::UpstreamError;
use crate::types::ChatMessage;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Successful chat completion
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    /// Full response body as returned by the endpoint
    pub raw_body: String,
    /// Text of the first choice (empty if the endpoint returned none)
    pub content: String,
    /// Prompt tokens from `usage` (0 if absent)
    pub prompt_tokens: i64,
    /// Completion tokens from `usage` (0 if absent)
    pub completion_tokens: i64,
    /// Total tokens from `usage` (prompt + completion if absent)
    pub total_tokens: i64,
}

impl ChatCompletion {
    /// Parse an OpenAI-style response body
    ///
    /// Anything without a `choices` array is rejected as
    /// [`UpstreamError::InvalidResponse`]; missing usage counts default to 0.
    pub fn from_body(raw_body: String) -> Result<Self, UpstreamError> {
        let value: Value = serde_json::from_str(&raw_body)
            .map_err(|e| UpstreamError::InvalidResponse(format!("body is not JSON: {}", e)))?;

        let choices = value
            .get("choices")
            .and_then(Value::as_array)
            .ok_or_else(|| UpstreamError::InvalidResponse("missing choices array".into()))?;

        let content = choices
            .first()
            .and_then(|c| c.pointer("/message/content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let usage = |field: &str| {
            value
                .get("usage")
                .and_then(|u| u.get(field))
                .and_then(Value::as_i64)
        };
        let prompt_tokens = usage("prompt_tokens").unwrap_or(0);
        let completion_tokens = usage("completion_tokens").unwrap_or(0);
        let total_tokens = usage("total_tokens").unwrap_or(prompt_tokens + completion_tokens);

        Ok(Self {
            raw_body,
            content,
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }
}

/// The opaque upstream call used by the request executor
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send one chat-completion request using the endpoint's model parameters and timeout
    async fn chat_completion(
        &self,
        endpoint: &Endpoint,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion, UpstreamError>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: i64,
    temperature: f64,
}

/// [`ChatClient`] for OpenAI-compatible HTTP endpoints
#[derive(Clone, Debug, Default)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    /// Create a client with a fresh connection pool
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a client on top of an existing reqwest client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatibleClient {
    async fn chat_completion(
        &self,
        endpoint: &Endpoint,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion, UpstreamError> {
        let url = format!("{}/chat/completions", endpoint.api_base.trim_end_matches('/'));
        let timeout = endpoint.timeout();
        let body = ChatCompletionRequest {
            model: &endpoint.model_name,
            messages,
            max_tokens: endpoint.max_tokens,
            temperature: endpoint.temperature,
        };

        tracing::debug!(url = %url, model = %endpoint.model_name, "Sending chat completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport_error(e, timeout))?;

        if status.is_success() {
            return ChatCompletion::from_body(text);
        }

        let body: Option<Value> = serde_json::from_str(&text).ok();
        let message = body
            .as_ref()
            .and_then(|b| {
                b.pointer("/error/message")
                    .or_else(|| b.get("message"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string)
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text.clone()
                }
            });

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(UpstreamError::RateLimited { message, body })
        } else {
            Err(UpstreamError::Api {
                status: status.as_u16(),
                message,
                body,
            })
        }
    }
}

fn classify_transport_error(e: reqwest::Error, timeout: std::time::Duration) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(timeout)
    } else {
        UpstreamError::Transport(e.to_string())
    }
}
