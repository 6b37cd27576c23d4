//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{agentic, boundary, dispatcher, endpoints, episode, providers, queue, retrieval};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Whether startup validation should be strict
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    /// Buffer queue (C1)
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker dispatcher (C2)
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Boundary detection (C3)
    #[serde(default)]
    pub boundary: BoundaryConfig,

    /// Episode batching (C5)
    #[serde(default)]
    pub episode: EpisodeConfig,

    /// Hybrid retrieval (C8)
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Agentic retrieval (C9)
    #[serde(default)]
    pub agentic: AgenticConfig,

    #[serde(default)]
    pub llm: LlmProviderConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub text_index: TextIndexConfig,

    #[serde(default)]
    pub vector_index: VectorIndexConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Upper bound a memorize call waits for its pipeline outcome
    #[serde(default = "default_memorize_timeout_s")]
    pub memorize_timeout_s: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1995
}

fn default_memorize_timeout_s() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
            memorize_timeout_s: default_memorize_timeout_s(),
        }
    }
}

/// Buffer queue configuration (C1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_length")]
    pub max_length: usize,
    #[serde(default = "default_queue_expire_minutes")]
    pub expire_minutes: u64,
    #[serde(default = "default_cleanup_probability")]
    pub cleanup_probability: f64,
    #[serde(default = "default_cache_timeout_s")]
    pub timeout_s: u64,
}

fn default_queue_max_length() -> usize {
    queue::MAX_LENGTH
}

fn default_queue_expire_minutes() -> u64 {
    queue::EXPIRE_MINUTES
}

fn default_cleanup_probability() -> f64 {
    queue::CLEANUP_PROBABILITY
}

fn default_cache_timeout_s() -> u64 {
    endpoints::CACHE_TIMEOUT_S
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_length: default_queue_max_length(),
            expire_minutes: default_queue_expire_minutes(),
            cleanup_probability: default_cleanup_probability(),
            timeout_s: default_cache_timeout_s(),
        }
    }
}

/// Dispatcher configuration (C2)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_num_queues")]
    pub num_queues: usize,
    #[serde(default = "default_max_total_messages")]
    pub max_total_messages: usize,
    #[serde(default = "default_shutdown_delay_s")]
    pub max_delay_seconds: u64,
}

fn default_num_queues() -> usize {
    dispatcher::NUM_QUEUES
}

fn default_max_total_messages() -> usize {
    dispatcher::MAX_TOTAL_MESSAGES
}

fn default_shutdown_delay_s() -> u64 {
    dispatcher::MAX_DELAY_SECONDS
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_queues: default_num_queues(),
            max_total_messages: default_max_total_messages(),
            max_delay_seconds: default_shutdown_delay_s(),
        }
    }
}

/// Boundary detection configuration (C3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryConfig {
    #[serde(default = "default_boundary_retries")]
    pub max_retries: u32,
    #[serde(default = "default_boundary_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_hard_cut_minutes")]
    pub hard_cut_minutes: i64,
    #[serde(default = "default_hard_cut_count")]
    pub hard_cut_count: usize,
}

fn default_boundary_retries() -> u32 {
    boundary::MAX_RETRIES
}

fn default_boundary_backoff_ms() -> u64 {
    boundary::RETRY_BACKOFF_MS
}

fn default_hard_cut_minutes() -> i64 {
    boundary::HARD_CUT_MINUTES
}

fn default_hard_cut_count() -> usize {
    boundary::HARD_CUT_COUNT
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_boundary_retries(),
            retry_backoff_ms: default_boundary_backoff_ms(),
            hard_cut_minutes: default_hard_cut_minutes(),
            hard_cut_count: default_hard_cut_count(),
        }
    }
}

/// Episode batching configuration (C5)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeConfig {
    #[serde(default = "default_episode_batch_size")]
    pub batch_size: usize,
}

fn default_episode_batch_size() -> usize {
    episode::BATCH_SIZE
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_episode_batch_size(),
        }
    }
}

/// Retrieval configuration (C8)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    #[serde(default = "default_candidates_per_side")]
    pub candidates_per_side: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Exclude records whose validity window does not contain current_time
    #[serde(default = "default_true")]
    pub validity_filter_enabled: bool,
}

fn default_rrf_k() -> f32 {
    retrieval::RRF_K
}

fn default_candidates_per_side() -> usize {
    retrieval::CANDIDATES_PER_SIDE
}

fn default_top_k() -> usize {
    retrieval::DEFAULT_TOP_K
}

fn default_true() -> bool {
    true
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidates_per_side: default_candidates_per_side(),
            default_top_k: default_top_k(),
            validity_filter_enabled: true,
        }
    }
}

/// Agentic retrieval configuration (C9)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgenticConfig {
    /// Round-1 fan-out; falls back to the request top_k when unset
    #[serde(default)]
    pub round1_k: Option<usize>,
    #[serde(default = "default_max_parallel_refined")]
    pub max_parallel_refined: usize,
    #[serde(default = "default_overall_timeout_s")]
    pub overall_timeout_s: u64,
    #[serde(default = "default_round1_timeout_s")]
    pub round1_timeout_s: u64,
    #[serde(default = "default_round2_timeout_s")]
    pub round2_timeout_s: u64,
    #[serde(default = "default_judge_timeout_s")]
    pub llm_judge_timeout_s: u64,
}

fn default_max_parallel_refined() -> usize {
    agentic::MAX_PARALLEL_REFINED
}

fn default_overall_timeout_s() -> u64 {
    agentic::OVERALL_TIMEOUT_S
}

fn default_round1_timeout_s() -> u64 {
    agentic::ROUND1_TIMEOUT_S
}

fn default_round2_timeout_s() -> u64 {
    agentic::ROUND2_TIMEOUT_S
}

fn default_judge_timeout_s() -> u64 {
    agentic::LLM_JUDGE_TIMEOUT_S
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            round1_k: None,
            max_parallel_refined: default_max_parallel_refined(),
            overall_timeout_s: default_overall_timeout_s(),
            round1_timeout_s: default_round1_timeout_s(),
            round2_timeout_s: default_round2_timeout_s(),
            llm_judge_timeout_s: default_judge_timeout_s(),
        }
    }
}

/// LLM provider configuration; env vars win over file values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_api_key")]
    pub api_key: String,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_concurrency")]
    pub max_concurrency: usize,
}

fn default_llm_base_url() -> String {
    std::env::var("LLM_BASE_URL").unwrap_or_else(|_| providers::LLM_BASE_URL.to_string())
}

fn default_llm_model() -> String {
    std::env::var("LLM_MODEL").unwrap_or_else(|_| providers::LLM_MODEL.to_string())
}

fn default_llm_api_key() -> String {
    std::env::var("LLM_API_KEY").unwrap_or_default()
}

fn default_llm_temperature() -> f32 {
    providers::LLM_TEMPERATURE
}

fn default_llm_max_tokens() -> usize {
    providers::LLM_MAX_TOKENS
}

fn default_llm_timeout_s() -> u64 {
    providers::LLM_TIMEOUT_S
}

fn default_llm_max_retries() -> u32 {
    3
}

fn default_llm_concurrency() -> usize {
    providers::LLM_MAX_CONCURRENCY
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: default_llm_api_key(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
            timeout_s: default_llm_timeout_s(),
            max_retries: default_llm_max_retries(),
            max_concurrency: default_llm_concurrency(),
        }
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_emb_base_url")]
    pub base_url: String,
    #[serde(default = "default_emb_model")]
    pub model: String,
    #[serde(default = "default_emb_api_key")]
    pub api_key: String,
    #[serde(default = "default_emb_dim")]
    pub dim: usize,
    #[serde(default = "default_emb_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_emb_concurrency")]
    pub max_concurrency: usize,
}

fn default_emb_base_url() -> String {
    std::env::var("EMB_BASE_URL").unwrap_or_else(|_| providers::EMB_BASE_URL.to_string())
}

fn default_emb_model() -> String {
    std::env::var("EMB_MODEL").unwrap_or_else(|_| providers::EMB_MODEL.to_string())
}

fn default_emb_api_key() -> String {
    std::env::var("EMB_API_KEY").unwrap_or_default()
}

fn default_emb_dim() -> usize {
    providers::EMB_DIM
}

fn default_emb_timeout_s() -> u64 {
    providers::EMB_TIMEOUT_S
}

fn default_emb_concurrency() -> usize {
    providers::EMB_MAX_CONCURRENCY
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_emb_base_url(),
            model: default_emb_model(),
            api_key: default_emb_api_key(),
            dim: default_emb_dim(),
            timeout_s: default_emb_timeout_s(),
            max_concurrency: default_emb_concurrency(),
        }
    }
}

/// Redis connection for the buffer queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| endpoints::REDIS_URL.to_string())
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

/// Document store (ScyllaDB) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_scylla_hosts")]
    pub scylla_hosts: Vec<String>,
    #[serde(default = "default_scylla_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
}

fn default_scylla_hosts() -> Vec<String> {
    std::env::var("SCYLLA_HOSTS")
        .map(|s| s.split(',').map(|h| h.trim().to_string()).collect())
        .unwrap_or_else(|_| vec![endpoints::SCYLLA_HOST.to_string()])
}

fn default_scylla_keyspace() -> String {
    std::env::var("SCYLLA_KEYSPACE").unwrap_or_else(|_| endpoints::SCYLLA_KEYSPACE.to_string())
}

fn default_replication_factor() -> u8 {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scylla_hosts: default_scylla_hosts(),
            keyspace: default_scylla_keyspace(),
            replication_factor: default_replication_factor(),
        }
    }
}

/// Text index (Tantivy) configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TextIndexConfig {
    /// Index directory; in-RAM when unset (tests, dev)
    #[serde(default)]
    pub path: Option<String>,
}

/// Vector index (Qdrant) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    #[serde(default = "default_qdrant_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_qdrant_collection")]
    pub collection: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_qdrant_endpoint() -> String {
    std::env::var("QDRANT_ENDPOINT").unwrap_or_else(|_| endpoints::QDRANT_ENDPOINT.to_string())
}

fn default_qdrant_collection() -> String {
    endpoints::QDRANT_COLLECTION.to_string()
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            endpoint: default_qdrant_endpoint(),
            collection: default_qdrant_collection(),
            api_key: None,
        }
    }
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

impl Settings {
    /// Validate settings; strict environments refuse to start misconfigured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_length == 0 {
            return Err(ConfigError::Invalid("queue.max_length must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.queue.cleanup_probability) {
            return Err(ConfigError::Invalid(
                "queue.cleanup_probability must be within [0, 1]".into(),
            ));
        }
        if self.dispatcher.num_queues == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.num_queues must be > 0".into(),
            ));
        }
        if self.episode.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "episode.batch_size must be > 0".into(),
            ));
        }
        if self.environment.is_strict() && self.llm.api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "llm.api_key is required outside development (set LLM_API_KEY)".into(),
            ));
        }
        Ok(())
    }
}

/// Load settings from config files and the environment.
///
/// Priority: `CHATMEM__*` env vars > `config/{env}.yaml` > `config/default.yaml`
/// > struct defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    let default_path = Path::new("config/default.yaml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    if let Some(env_name) = env {
        let env_path_string = format!("config/{env_name}.yaml");
        let env_path = Path::new(&env_path_string);
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path));
        } else {
            tracing::warn!(path = %env_path_string, "environment config file not found, skipping");
        }
    }

    builder = builder.add_source(Environment::with_prefix("CHATMEM").separator("__"));

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
