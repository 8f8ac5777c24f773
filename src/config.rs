use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::Sensor;

/// Run configuration, loaded once from a YAML file and read-only after
/// that. API keys may be left empty in the file and are then resolved
/// from `<PROVIDER>_API_KEY` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub providers: HashMap<String, ProviderConfig>,
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub model_rate_limits: HashMap<String, u32>,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,
    #[serde(default = "default_reviews_path")]
    pub reviews_path: PathBuf,
    #[serde(default = "default_datasheet_paths")]
    pub datasheet_paths: Vec<PathBuf>,
    #[serde(default)]
    pub prompt_template_path: Option<PathBuf>,
    #[serde(default)]
    pub review_prompt_template_path: Option<PathBuf>,
    #[serde(default = "default_chunk_delay")]
    pub chunk_delay_seconds: u64,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results/datasheets")
}

fn default_reviews_path() -> PathBuf {
    PathBuf::from("results/reviews")
}

fn default_datasheet_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("datasheet"),
        PathBuf::from("data/official_datasheets"),
        PathBuf::from("datasheets"),
    ]
}

fn default_chunk_delay() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sensorbench.db")
}

fn default_timeout() -> u64 {
    120
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))?;
        config.resolve_api_keys();
        Ok(config)
    }

    /// Fill empty api_key fields from the environment, e.g. the
    /// "openrouter" provider reads OPENROUTER_API_KEY.
    fn resolve_api_keys(&mut self) {
        for (name, provider) in self.providers.iter_mut() {
            if provider.api_key.is_empty() {
                let var = format!("{}_API_KEY", name.to_uppercase());
                if let Ok(key) = std::env::var(&var) {
                    provider.api_key = key;
                }
            }
        }
    }

    pub fn provider(&self, name: &str) -> Result<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::Config(format!("provider '{}' is not configured", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
providers:
  openrouter:
    api_key: "sk-test"
    base_url: "https://openrouter.ai/api/v1"
    timeout_seconds: 90
    rate_limit:
      requests_per_minute: 20
  google_gemini:
    api_key: "gm-test"
models:
  - id: "openai/gpt-4"
    provider: "openrouter"
  - id: "gemini-1.5-pro"
    provider: "google_gemini"
model_rate_limits:
  "openai/gpt-4": 5
sensors:
  - brand: "Bosch"
    type: "BME280"
"#;

    #[test]
    fn parses_sample_config() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.sensors.len(), 1);
        assert_eq!(config.model_rate_limits["openai/gpt-4"], 5);

        let openrouter = config.provider("openrouter").unwrap();
        assert_eq!(openrouter.timeout_seconds, 90);
        assert_eq!(
            openrouter.rate_limit.as_ref().unwrap().requests_per_minute,
            20
        );

        // Defaults apply where the file is silent.
        let gemini = config.provider("google_gemini").unwrap();
        assert_eq!(gemini.timeout_seconds, 120);
        assert!(gemini.base_url.is_none());
        assert_eq!(config.chunk_delay_seconds, 30);
    }

    #[test]
    fn unknown_provider_lookup_fails() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert!(matches!(
            config.provider("anthropic"),
            Err(Error::Config(_))
        ));
    }
}
