use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::{pin_mut, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::llm::provider::{effective_timeout, snippet, ProviderClient};
use crate::llm::rate_limiter::RateLimiter;
use crate::llm::retry::{with_retries, RetryPolicy};
use crate::models::{ModelRequest, ModelResponse};

/// Client for OpenRouter-compatible chat-completion APIs. Paces itself
/// through the shared rate limiter when one is attached and retries
/// transient failures with capped exponential backoff.
#[derive(Debug)]
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    provider_name: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl OpenRouterClient {
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
        let base_url = config.base_url.clone().ok_or_else(|| {
            Error::Config(format!("provider '{}' requires base_url", provider_name))
        })?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
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
        let body = ChatRequest {
            model: &request.model_id,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        model: request.model_id.clone(),
                        seconds: timeout.as_secs_f64(),
                    }
                } else {
                    Error::Network(e)
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            self.apply_advertised_limit(&request.model_id, &body).await;
            return Err(Error::RateLimited {
                model: request.model_id.clone(),
                message: snippet(&body),
            });
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Server {
                provider: self.provider_name.clone(),
                model: request.model_id.clone(),
                message: format!("HTTP {}: {}", status, snippet(&body)),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                provider: self.provider_name.clone(),
                model: request.model_id.clone(),
                message: format!("HTTP {}: {}", status, snippet(&body)),
            });
        }

        let text = response.text().await?;
        Ok(match serde_json::from_str::<Value>(&text) {
            Ok(payload) => normalize_payload(payload),
            // Not JSON at all; hand the raw body back instead of failing.
            Err(_) => ModelResponse::from_text(text),
        })
    }

    /// 429 payloads sometimes advertise the real ceiling; feed it into
    /// the shared limiter so the next attempt paces itself correctly.
    async fn apply_advertised_limit(&self, model_id: &str, body: &str) {
        let Some(limiter) = &self.limiter else { return };
        if let Some(rpm) = advertised_limit(body) {
            limiter.update_rate_limit(model_id, rpm).await;
        }
    }

    /// Streams completion fragments as the provider produces them. The
    /// stream is finite and not restartable; dropping it abandons the
    /// remaining fragments. A mid-stream failure surfaces as one final
    /// fragment carrying the error text, since the consumer has already
    /// committed to incremental output.
    pub fn stream_request(&self, request: &ModelRequest) -> impl Stream<Item = String> + Send {
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.base_url);
        let api_key = self.api_key.clone();
        let provider_name = self.provider_name.clone();
        let model_id = request.model_id.clone();
        let limiter = self.limiter.clone();
        let body = serde_json::json!({
            "model": request.model_id,
            "messages": [{ "role": "user", "content": request.prompt }],
            "stream": true,
        });

        stream! {
            if let Some(limiter) = &limiter {
                limiter.wait_if_needed(&provider_name, &model_id).await;
            }

            let response = match client.post(&url).bearer_auth(&api_key).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    yield format!("[stream error: {}]", e);
                    return;
                }
            };
            if !response.status().is_success() {
                yield format!("[stream error: HTTP {}]", response.status());
                return;
            }

            let fragments = decode_sse(response.bytes_stream());
            pin_mut!(fragments);
            while let Some(fragment) = fragments.next().await {
                yield fragment;
            }
        }
    }
}

/// Decodes an SSE byte stream into completion text fragments, carrying
/// partial lines across chunk boundaries. A transport error mid-stream
/// becomes one final fragment holding the error text.
fn decode_sse<S, B, E>(bytes: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    stream! {
        pin_mut!(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield format!("[stream error: {}]", e);
                    return;
                }
            };
            buffer.extend_from_slice(chunk.as_ref());
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim()) {
                    SseEvent::Fragment(text) => yield text,
                    SseEvent::Done => return,
                    SseEvent::Skip => {}
                }
            }
        }
    }
}

#[async_trait]
impl ProviderClient for OpenRouterClient {
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

/// Maps the heterogeneous response shapes onto ModelResponse: primary
/// chat-completion content, an alternate top-level "output" field, or,
/// for anything unrecognized, the serialized payload itself.
fn normalize_payload(payload: Value) -> ModelResponse {
    let text = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| payload.get("output").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string());

    let input_tokens = payload
        .pointer("/usage/prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = payload
        .pointer("/usage/completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    ModelResponse {
        text,
        input_tokens,
        output_tokens,
    }
}

/// Pulls a server-advertised requests-per-minute ceiling out of a 429
/// body, where it hides in the error's nested metadata headers.
fn advertised_limit(body: &str) -> Option<u32> {
    let payload: Value = serde_json::from_str(body).ok()?;
    let header = payload
        .pointer("/error/metadata/headers/X-RateLimit-Limit")
        .or_else(|| payload.pointer("/metadata/headers/X-RateLimit-Limit"))?;
    let rpm = match header {
        Value::String(s) => s.parse::<u32>().ok(),
        other => other.as_u64().map(|n| n as u32),
    };
    rpm.filter(|&rpm| rpm > 0)
}

enum SseEvent {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(payload) => match payload
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            Some(text) if !text.is_empty() => SseEvent::Fragment(text.to_string()),
            _ => SseEvent::Skip,
        },
        Err(_) => SseEvent::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            api_key: "sk-test".to_string(),
            base_url: Some("https://openrouter.ai/api/v1".to_string()),
            timeout_seconds: 120,
            rate_limit: None,
        }
    }

    #[test]
    fn missing_base_url_is_a_config_error() {
        let config = ProviderConfig {
            base_url: None,
            ..test_config()
        };
        let err = OpenRouterClient::new(&config, "openrouter", None).unwrap_err();
        match err {
            Error::Config(message) => assert!(message.contains("openrouter")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_api_key_fails_at_construction() {
        let config = ProviderConfig {
            api_key: String::new(),
            ..test_config()
        };
        let err = OpenRouterClient::new(&config, "openrouter", None).unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[test]
    fn slow_models_get_a_tripled_timeout() {
        let base = Duration::from_secs(120);
        assert_eq!(
            effective_timeout(base, "google/gemini-2.5-pro-exp"),
            Duration::from_secs(360)
        );
        assert_eq!(effective_timeout(base, "openai/gpt-4"), base);
    }

    #[test]
    fn wire_payload_token_counts_round_trip_exactly() {
        let payload = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "the datasheet" } }],
            "usage": { "prompt_tokens": 1234, "completion_tokens": 567 }
        });
        let response = normalize_payload(payload);
        assert_eq!(response.text, "the datasheet");
        assert_eq!(response.input_tokens, 1234);
        assert_eq!(response.output_tokens, 567);
    }

    #[test]
    fn alternate_output_field_is_accepted() {
        let payload = serde_json::json!({ "output": "plain text answer" });
        let response = normalize_payload(payload);
        assert_eq!(response.text, "plain text answer");
        assert_eq!(response.input_tokens, 0);
        assert_eq!(response.output_tokens, 0);
    }

    #[test]
    fn unrecognized_shape_degrades_to_serialized_payload() {
        let payload = serde_json::json!({ "surprise": { "nested": true } });
        let response = normalize_payload(payload);
        assert!(response.text.contains("surprise"));
        assert_eq!(response.input_tokens, 0);
    }

    #[test]
    fn advertised_limit_is_read_from_nested_headers() {
        let body = r#"{
            "error": {
                "code": 429,
                "message": "Rate limit exceeded",
                "metadata": { "headers": { "X-RateLimit-Limit": "20" } }
            }
        }"#;
        assert_eq!(advertised_limit(body), Some(20));
        assert_eq!(advertised_limit("{}"), None);
        assert_eq!(advertised_limit("not json"), None);
    }

    #[test]
    fn sse_lines_decode_to_fragments() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert!(matches!(parse_sse_line(line), SseEvent::Fragment(s) if s == "Hel"));
        assert!(matches!(parse_sse_line("data: [DONE]"), SseEvent::Done));
        assert!(matches!(parse_sse_line(": keep-alive"), SseEvent::Skip));
        assert!(matches!(parse_sse_line("data: {\"choices\":[]}"), SseEvent::Skip));
    }

    #[tokio::test]
    async fn stream_reassembles_lines_split_across_chunks() {
        let chunks: Vec<std::result::Result<&[u8], std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":".as_slice()),
            Ok(b"{\"content\":\"Hel\"}}]}\n".as_slice()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\ndata: [DONE]\n".as_slice()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n".as_slice()),
        ];

        let fragments: Vec<String> = decode_sse(futures::stream::iter(chunks)).collect().await;
        assert_eq!(fragments, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn mid_stream_failure_yields_one_final_error_fragment() {
        let chunks: Vec<std::result::Result<&[u8], std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n".as_slice()),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        ];

        let fragments: Vec<String> = decode_sse(futures::stream::iter(chunks)).collect().await;
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], "partial");
        assert!(fragments[1].contains("connection reset"), "got: {}", fragments[1]);
    }
}
