//! Bounded queue cache over Redis sorted sets
//!
//! Each key holds a time-ordered queue of opaque payloads:
//! - append = ZADD with a millisecond score + TTL refresh, atomic per call
//! - a probabilistic (or forced) Lua trim keeps the queue at `max_length`
//! - range reads run a single server-side script to avoid TOCTOU races
//!
//! The memorize pipeline uses one queue per conversation group as the
//! durable buffer in front of boundary detection.

pub mod payload;
pub mod queue;

pub use payload::{QueuePayload, PAYLOAD_JSON_PREFIX, PAYLOAD_BINARY_PREFIX};
pub use queue::{BoundedQueueCache, BufferCache, QueueItem, QueueStats};

use thiserror::Error;

/// Cache errors; connection and timeout failures are retriable
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("script error: {0}")]
    Script(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Connection(err.to_string())
    }
}

impl CacheError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, CacheError::Connection(_) | CacheError::Timeout(_))
    }
}
