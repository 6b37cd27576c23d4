//! Configuration for the chatmem memory service
//!
//! Settings are layered: struct defaults, then `config/default.yaml`, then
//! `config/{environment}.yaml`, then `CHATMEM__*` environment variables.
//! A handful of well-known provider variables (`LLM_API_KEY`, `EMB_BASE_URL`,
//! `REDIS_URL`, ...) are read directly as defaults so deployments can set
//! only those.

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, AgenticConfig, BoundaryConfig, DispatcherConfig, EmbeddingConfig,
    EpisodeConfig, LlmProviderConfig, ObservabilityConfig, QueueConfig, RedisConfig,
    RetrievalConfig, RuntimeEnvironment, ServerConfig, Settings, StorageConfig,
    TextIndexConfig, VectorIndexConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
