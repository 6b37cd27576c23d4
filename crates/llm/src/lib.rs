//! LLM and embedding provider clients
//!
//! Features:
//! - `LlmBackend` trait with an OpenAI-compatible HTTP implementation
//! - Retry with exponential backoff for transient failures
//! - Global concurrency semaphores capping fan-out to external services
//! - `Embedder` trait with an HTTP embedding client
//! - Constrained-JSON response parsing helpers

pub mod backend;
pub mod embeddings;
pub mod prompt;

pub use backend::{GenerationResult, LlmBackend, OpenAiBackend};
pub use embeddings::{Embedder, HttpEmbedder};
pub use prompt::{extract_json_object, Message, Role};

use thiserror::Error;

/// LLM and embedding errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl LlmError {
    /// Transient failures worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Network(_) | LlmError::Timeout)
    }
}
