//! Embedding provider client
//!
//! Speaks the OpenAI-compatible `/embeddings` shape. Embedding fan-out is
//! capped by its own semaphore, wider than the LLM one since embedding
//! calls are cheap and short.

use async_trait::async_trait;
use chatmem_config::EmbeddingConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::LlmError;

/// Embedding backend trait
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Embed a batch; default loops over `embed`
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Vector dimension
    fn dim(&self) -> usize;
}

/// HTTP embedding client
pub struct HttpEmbedder {
    client: Client,
    config: EmbeddingConfig,
    permits: Arc<Semaphore>,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self, LlmError> {
        if config.base_url.is_empty() {
            return Err(LlmError::Configuration("embedding base_url is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));

        Ok(Self {
            client,
            config,
            permits,
        })
    }

    fn embeddings_url(&self) -> String {
        format!(
            "{}/embeddings",
            self.config.base_url.trim_end_matches('/')
        )
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Configuration("embedding semaphore closed".into()))?;

        let request = EmbedRequest {
            model: &self.config.model,
            input: vec![text],
        };

        let mut builder = self.client.post(self.embeddings_url()).json(&request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Embedding(format!(
                "embedding request failed: {status} - {body}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Embedding(format!("failed to parse response: {e}")))?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::Embedding("no embedding returned".into()))?;

        if embedding.len() != self.config.dim {
            tracing::warn!(
                expected = self.config.dim,
                actual = embedding.len(),
                model = %self.config.model,
                "embedding dimension mismatch"
            );
        }

        Ok(embedding)
    }

    fn dim(&self) -> usize {
        self.config.dim
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}
