use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error for provider {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("Request to {model} timed out after {seconds:.0}s")]
    Timeout { model: String, seconds: f64 },

    #[error("Rate limit exceeded for {model}: {message}")]
    RateLimited { model: String, message: String },

    #[error("Provider {provider} server error for {model}: {message}")]
    Server {
        provider: String,
        model: String,
        message: String,
    },

    #[error("Provider {provider} rejected request for {model}: {message}")]
    Api {
        provider: String,
        model: String,
        message: String,
    },

    #[error("Review chunk {chunk} produced no parsable JSON: {message}")]
    ChunkExtraction { chunk: u8, message: String },

    #[error("Review chunk {chunk} failed schema validation: {message}")]
    ChunkValidation { chunk: u8, message: String },

    #[error("Official datasheet not found for {0}")]
    DatasheetNotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures worth another attempt: timeouts, rate-limit
    /// signals, 5xx responses, and transport-level errors.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::RateLimited { .. }
                | Error::Server { .. }
                | Error::Network(_)
        )
    }
}
