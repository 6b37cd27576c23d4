//! LLM backend implementations
//!
//! A single OpenAI-compatible chat-completions backend covers every
//! provider this service talks to (hosted APIs and local servers alike).
//! Transient failures retry with exponential backoff; a process-wide
//! semaphore caps concurrent calls so a burst of extractions cannot
//! saturate the provider.

use async_trait::async_trait;
use chatmem_config::LlmProviderConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::prompt::Message;
use crate::LlmError;

/// Result of one generation call
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub completion_tokens: usize,
    pub total_time_ms: u64,
}

/// LLM backend trait
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generate a completion for the given messages
    async fn generate(&self, messages: &[Message]) -> Result<GenerationResult, LlmError>;

    /// Model identifier, for logs and metadata
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat backend
pub struct OpenAiBackend {
    client: Client,
    config: LlmProviderConfig,
    permits: Arc<Semaphore>,
    initial_backoff: Duration,
}

impl OpenAiBackend {
    pub fn new(config: LlmProviderConfig) -> Result<Self, LlmError> {
        if config.base_url.is_empty() {
            return Err(LlmError::Configuration("llm base_url is empty".into()));
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
            initial_backoff: Duration::from_millis(200),
        })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn execute(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, LlmError> {
        let mut builder = self.client.post(self.chat_url()).json(request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 5xx is transient, 4xx is not
            if status.is_server_error() {
                return Err(LlmError::Network(format!("server error {status}: {body}")));
            }
            return Err(LlmError::Api(format!("HTTP {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn generate(&self, messages: &[Message]) -> Result<GenerationResult, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Configuration("llm semaphore closed".into()))?;

        let start = std::time::Instant::now();
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut last_error = None;
        let mut backoff = self.initial_backoff;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    attempt,
                    max = self.config.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "LLM request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.execute(&request).await {
                Ok(response) => {
                    let choice = response.choices.into_iter().next().ok_or_else(|| {
                        LlmError::InvalidResponse("no choices in response".into())
                    })?;
                    return Ok(GenerationResult {
                        text: choice.message.content,
                        completion_tokens: response
                            .usage
                            .map(|u| u.completion_tokens)
                            .unwrap_or(0),
                        total_time_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(e) if e.is_retryable() => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Network("max retries exceeded".into())))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// OpenAI wire types

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: usize,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    completion_tokens: usize,
}
