use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

use crate::config::Config;

/// Paces outgoing requests per model or, as a fallback, per provider.
/// One instance is shared by every client built for a run; it is handed
/// to clients at construction time rather than living in a global.
///
/// Lock policy: the needed wait is computed under the lock, the lock is
/// released before sleeping, and re-acquired to stamp the new timestamp.
/// Unrelated keys therefore never serialize behind another key's wait.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    provider_limits: HashMap<String, u32>,
    model_limits: HashMap<String, u32>,
    last_request: HashMap<String, Instant>,
}

impl LimiterState {
    /// Model-specific limits take precedence over provider-level ones.
    /// Returns the pacing key and its requests-per-minute ceiling, or
    /// None when neither level is configured.
    fn resolve(&self, provider_name: &str, model_id: &str) -> Option<(String, u32)> {
        if let Some(&rpm) = self.model_limits.get(model_id) {
            if rpm > 0 {
                return Some((model_id.to_string(), rpm));
            }
        }
        if let Some(&rpm) = self.provider_limits.get(provider_name) {
            if rpm > 0 {
                return Some((format!("provider:{}", provider_name), rpm));
            }
        }
        None
    }

    fn required_wait(&self, key: &str, rpm: u32) -> Duration {
        let Some(last) = self.last_request.get(key) else {
            return Duration::ZERO;
        };
        let seconds_per_request = Duration::from_secs_f64(60.0 / rpm as f64);
        seconds_per_request.saturating_sub(last.elapsed())
    }
}

impl RateLimiter {
    pub fn from_config(config: &Config) -> Self {
        let provider_limits = config
            .providers
            .iter()
            .filter_map(|(name, provider)| {
                provider
                    .rate_limit
                    .as_ref()
                    .map(|limit| (name.clone(), limit.requests_per_minute))
            })
            .collect();
        Self::with_limits(provider_limits, config.model_rate_limits.clone())
    }

    pub fn with_limits(
        provider_limits: HashMap<String, u32>,
        model_limits: HashMap<String, u32>,
    ) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                provider_limits,
                model_limits,
                last_request: HashMap::new(),
            }),
        }
    }

    /// Suspends the caller until the minimum inter-request interval for
    /// the applicable key has elapsed, then records the request time as
    /// "now" (bursts after an idle period are not penalized). Returns the
    /// seconds actually waited; 0 when no limit applies.
    pub async fn wait_if_needed(&self, provider_name: &str, model_id: &str) -> f64 {
        let (key, wait) = {
            let state = self.state.lock().await;
            let Some((key, rpm)) = state.resolve(provider_name, model_id) else {
                return 0.0;
            };
            (key.clone(), state.required_wait(&key, rpm))
        };

        if !wait.is_zero() {
            tracing::info!(
                "Rate limiting: waiting {:.2}s for {}",
                wait.as_secs_f64(),
                key
            );
            sleep(wait).await;
        }

        self.state.lock().await.last_request.insert(key, Instant::now());
        wait.as_secs_f64()
    }

    /// Replaces a model's ceiling at runtime, e.g. from a 429 payload
    /// that advertises the real limit. Takes effect on the next call and
    /// leaves every other key untouched.
    pub async fn update_rate_limit(&self, model_id: &str, new_rpm: u32) {
        let mut state = self.state.lock().await;
        state.model_limits.insert(model_id.to_string(), new_rpm);
        tracing::info!("Updated rate limit for {} to {} rpm", model_id, new_rpm);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_limits(HashMap::new(), HashMap::new())
    }
}
