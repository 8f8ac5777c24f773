pub mod extractor;
pub mod factory;
pub mod gemini;
pub mod openrouter;
pub mod provider;
pub mod rate_limiter;
pub mod retry;

pub use extractor::{extract, recover_json, Extraction};
pub use factory::ClientFactory;
pub use gemini::GeminiClient;
pub use openrouter::OpenRouterClient;
pub use provider::ProviderClient;
pub use rate_limiter::RateLimiter;
pub use retry::{with_retries, RetryFailure, RetryPolicy};
