pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod review;
pub mod storage;

pub use config::{Config, ModelEntry, ProviderConfig};
pub use error::{Error, Result};
pub use llm::{ClientFactory, ProviderClient, RateLimiter};
pub use pipeline::ComparisonPipeline;
pub use storage::Storage;
