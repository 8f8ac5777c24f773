use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::llm::provider::{effective_timeout, snippet, ProviderClient};
use crate::llm::rate_limiter::RateLimiter;
use crate::llm::retry::{with_retries, RetryPolicy};
use crate::models::{ModelRequest, ModelResponse};

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Client for the Gemini generateContent API. Unlike the HTTP variant,
/// each network call runs on its own background task while the caller
/// blocks on a bounded wait; a slow call is aborted at the deadline so
/// it cannot hang a whole run. The abort is best-effort: the underlying
/// request may still run to completion invisibly.
#[derive(Debug)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    endpoint: String,
    timeout: Duration,
    retry: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    provider_name: String,
}

impl GeminiClient {
    pub fn new(
        config: &ProviderConfig,
        provider_name: &str,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Auth {
                provider: provider_name.to_string(),
                message: "api_key is missing".to_string(),
            });
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs(config.timeout_seconds),
            retry: RetryPolicy::default(),
            limiter,
            provider_name: provider_name.to_string(),
        })
    }

    async fn attempt_send(&self, request: &ModelRequest) -> Result<ModelResponse> {
        if let Some(limiter) = &self.limiter {
            limiter
                .wait_if_needed(&self.provider_name, &request.model_id)
                .await;
        }

        let timeout = effective_timeout(self.timeout, &request.model_id);
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.endpoint, request.model_id, self.api_key
        );
        let body = json!({ "contents": [{ "parts": [{ "text": request.prompt }] }] });

        let handle = tokio::spawn(execute(
            self.client.clone(),
            url,
            body,
            self.provider_name.clone(),
            request.model_id.clone(),
        ));
        bounded_call(timeout, handle, &self.provider_name, &request.model_id).await
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    async fn send_request(&self, request: &ModelRequest) -> Result<ModelResponse> {
        with_retries(&self.retry, |_| self.attempt_send(request))
            .await
            .map_err(|failure| {
                tracing::error!(
                    "Request to {} via {} failed after {} attempts: {}",
                    request.model_id,
                    self.provider_name,
                    failure.attempts,
                    failure.last_error
                );
                failure.into_error()
            })
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

/// Waits for the spawned call up to `timeout`, then aborts it and
/// reports the timeout that was actually in effect.
async fn bounded_call<T>(
    timeout: Duration,
    handle: JoinHandle<Result<T>>,
    provider: &str,
    model: &str,
) -> Result<T> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(Error::Api {
            provider: provider.to_string(),
            model: model.to_string(),
            message: format!("background task failed: {}", join_err),
        }),
        Err(_) => {
            abort.abort();
            Err(Error::Timeout {
                model: model.to_string(),
                seconds: timeout.as_secs_f64(),
            })
        }
    }
}

async fn execute(
    client: Client,
    url: String,
    body: Value,
    provider: String,
    model: String,
) -> Result<ModelResponse> {
    let response = client.post(&url).json(&body).send().await?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::RateLimited {
            model,
            message: snippet(&text),
        });
    }
    if status.is_server_error() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::Server {
            provider,
            model,
            message: format!("HTTP {}: {}", status, snippet(&text)),
        });
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::Api {
            provider,
            model,
            message: format!("HTTP {}: {}", status, snippet(&text)),
        });
    }

    let text = response.text().await?;
    Ok(match serde_json::from_str::<Value>(&text) {
        Ok(payload) => normalize_payload(payload),
        Err(_) => ModelResponse::from_text(text),
    })
}

/// Joins candidate text parts and reads token counts from the usage
/// metadata object, which arrives camelCased over REST and snake_cased
/// through the SDK transport.
fn normalize_payload(payload: Value) -> ModelResponse {
    let text = payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|joined| !joined.is_empty())
        .unwrap_or_else(|| payload.to_string());

    let input_tokens = payload
        .pointer("/usageMetadata/promptTokenCount")
        .or_else(|| payload.pointer("/usage_metadata/prompt_token_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = payload
        .pointer("/usageMetadata/candidatesTokenCount")
        .or_else(|| payload.pointer("/usage_metadata/candidates_token_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    ModelResponse {
        text,
        input_tokens,
        output_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            api_key: "gm-test".to_string(),
            base_url: None,
            timeout_seconds: 120,
            rate_limit: None,
        }
    }

    #[test]
    fn constructs_without_base_url() {
        let client = GeminiClient::new(&test_config(), "google_gemini", None).unwrap();
        assert_eq!(client.name(), "google_gemini");
        assert_eq!(client.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn empty_api_key_fails_at_construction() {
        let config = ProviderConfig {
            api_key: String::new(),
            ..test_config()
        };
        let err = GeminiClient::new(&config, "google_gemini", None).unwrap_err();
        match err {
            Error::Auth { provider, .. } => assert_eq!(provider, "google_gemini"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn usage_metadata_token_counts_are_read() {
        let payload = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "part one, " }, { "text": "part two" }] } }],
            "usageMetadata": { "promptTokenCount": 321, "candidatesTokenCount": 64 }
        });
        let response = normalize_payload(payload);
        assert_eq!(response.text, "part one, part two");
        assert_eq!(response.input_tokens, 321);
        assert_eq!(response.output_tokens, 64);
    }

    #[test]
    fn snake_case_usage_metadata_is_also_accepted() {
        let payload = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }],
            "usage_metadata": { "prompt_token_count": 10, "candidates_token_count": 2 }
        });
        let response = normalize_payload(payload);
        assert_eq!(response.input_tokens, 10);
        assert_eq!(response.output_tokens, 2);
    }

    #[test]
    fn unrecognized_shape_degrades_to_serialized_payload() {
        let payload = serde_json::json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let response = normalize_payload(payload);
        assert!(response.text.contains("promptFeedback"));
        assert_eq!(response.output_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_call_aborts_at_the_deadline() {
        let handle: JoinHandle<Result<ModelResponse>> =
            tokio::spawn(async { futures::future::pending().await });

        let err = bounded_call(
            Duration::from_secs(360),
            handle,
            "google_gemini",
            "gemini-2.5-pro",
        )
        .await
        .unwrap_err();

        match err {
            Error::Timeout { model, seconds } => {
                assert_eq!(model, "gemini-2.5-pro");
                assert_eq!(seconds, 360.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
