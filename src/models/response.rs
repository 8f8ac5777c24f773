use serde::{Deserialize, Serialize};

/// One prompt bound for one model. Built fresh per call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model_id: String,
    pub prompt: String,
}

impl ModelRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
        }
    }
}

/// Normalized provider response. `text` is always present; token counts
/// fall back to 0 when the provider omits usage metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl ModelResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}
