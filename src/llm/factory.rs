use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::llm::gemini::GeminiClient;
use crate::llm::openrouter::OpenRouterClient;
use crate::llm::provider::ProviderClient;
use crate::llm::rate_limiter::RateLimiter;

pub struct ClientFactory;

impl ClientFactory {
    /// Maps a provider-name tag onto its concrete client variant,
    /// validating the per-variant configuration before any network
    /// activity. Pass the shared limiter to pace the client; None leaves
    /// it unthrottled.
    pub fn get_client(
        config: &ProviderConfig,
        provider_name: &str,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Arc<dyn ProviderClient>> {
        match provider_name {
            "openrouter" => Ok(Arc::new(OpenRouterClient::new(
                config,
                provider_name,
                limiter,
            )?)),
            "google_gemini" | "gemini" => Ok(Arc::new(GeminiClient::new(
                config,
                provider_name,
                limiter,
            )?)),
            other => Err(Error::Config(format!(
                "unknown provider '{}' (expected 'openrouter' or 'google_gemini')",
                other
            ))),
        }
    }
}
