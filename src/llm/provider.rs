use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ModelRequest, ModelResponse};

/// One LLM provider surface. Implementations pace themselves through the
/// shared rate limiter, retry transient failures internally, and always
/// hand back a normalized response.
#[async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    async fn send_request(&self, request: &ModelRequest) -> Result<ModelResponse>;

    fn name(&self) -> &str;
}

/// Model families that systematically blow through the default timeout.
/// Matching is a plain substring test on the model id.
pub(crate) const SLOW_MODEL_MARKERS: [&str; 3] = ["gemini-2.5-pro", "deepseek-r1", "qwq"];

const SLOW_MODEL_TIMEOUT_MULTIPLIER: u32 = 3;

pub(crate) fn effective_timeout(base: Duration, model_id: &str) -> Duration {
    if SLOW_MODEL_MARKERS.iter().any(|marker| model_id.contains(marker)) {
        base * SLOW_MODEL_TIMEOUT_MULTIPLIER
    } else {
        base
    }
}

/// Bounds error bodies quoted into error messages and logs.
pub(crate) fn snippet(text: &str) -> String {
    if text.chars().count() <= 200 {
        text.to_string()
    } else {
        let cut: String = text.chars().take(200).collect();
        format!("{}...", cut)
    }
}
