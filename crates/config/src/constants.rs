//! Centralized constants
//!
//! Defaults that more than one crate relies on live here so settings and
//! component-level `Default` impls cannot drift apart.

/// Buffer queue (C1) defaults
pub mod queue {
    /// Maximum entries retained per buffer key
    pub const MAX_LENGTH: usize = 100;
    /// Whole-queue TTL, refreshed on every append
    pub const EXPIRE_MINUTES: u64 = 60;
    /// Probability that an append also trims the queue
    pub const CLEANUP_PROBABILITY: f64 = 0.1;
    /// Buffer key namespace
    pub const BUFFER_KEY_PREFIX: &str = "memcell:buffer:";
}

/// Dispatcher (C2) defaults
pub mod dispatcher {
    pub const NUM_QUEUES: usize = 10;
    pub const MAX_TOTAL_MESSAGES: usize = 200;
    /// Soft-shutdown drain budget
    pub const MAX_DELAY_SECONDS: u64 = 30;
}

/// Boundary detection (C3) defaults
pub mod boundary {
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BACKOFF_MS: u64 = 500;
    /// A silence gap longer than this force-closes the segment
    pub const HARD_CUT_MINUTES: i64 = 30;
    /// Buffers larger than this force-emit; mirrors the queue bound
    pub const HARD_CUT_COUNT: usize = super::queue::MAX_LENGTH;
    /// Never emit at or below this many buffered messages
    pub const MIN_MESSAGES: usize = 2;
}

/// Episode summarization (C5) defaults
pub mod episode {
    /// Unlinked MemCells per group before an Episode is derived
    pub const BATCH_SIZE: usize = 10;
}

/// Retrieval (C8) defaults
pub mod retrieval {
    pub const RRF_K: f32 = 60.0;
    pub const CANDIDATES_PER_SIDE: usize = 100;
    pub const DEFAULT_TOP_K: usize = 20;
    /// Query terms kept for boosted keyword search, best smart score first
    pub const MAX_QUERY_TERMS: usize = 10;
}

/// Agentic retrieval (C9) defaults
pub mod agentic {
    pub const MAX_PARALLEL_REFINED: usize = 3;
    pub const OVERALL_TIMEOUT_S: u64 = 180;
    pub const ROUND1_TIMEOUT_S: u64 = 30;
    pub const ROUND2_TIMEOUT_S: u64 = 60;
    pub const LLM_JUDGE_TIMEOUT_S: u64 = 15;
}

/// Provider defaults
pub mod providers {
    pub const LLM_BASE_URL: &str = "http://localhost:11434/v1";
    pub const LLM_MODEL: &str = "qwen3:4b-instruct-2507-q4_K_M";
    pub const LLM_TEMPERATURE: f32 = 0.3;
    pub const LLM_MAX_TOKENS: usize = 16384;
    pub const LLM_TIMEOUT_S: u64 = 60;
    pub const LLM_MAX_CONCURRENCY: usize = 8;

    pub const EMB_BASE_URL: &str = "http://localhost:11434/v1";
    pub const EMB_MODEL: &str = "qwen3-embedding:0.6b";
    pub const EMB_DIM: usize = 1024;
    pub const EMB_TIMEOUT_S: u64 = 30;
    pub const EMB_MAX_CONCURRENCY: usize = 32;
}

/// Storage endpoints
pub mod endpoints {
    pub const REDIS_URL: &str = "redis://127.0.0.1:6379";
    pub const SCYLLA_HOST: &str = "127.0.0.1:9042";
    pub const SCYLLA_KEYSPACE: &str = "chatmem";
    pub const QDRANT_ENDPOINT: &str = "http://localhost:6334";
    pub const QDRANT_COLLECTION: &str = "memory_records";
    pub const CACHE_TIMEOUT_S: u64 = 30;
}
