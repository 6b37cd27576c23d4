//! Per-key bounded queue over Redis sorted sets

use crate::payload::QueuePayload;
use crate::CacheError;
use async_trait::async_trait;
use chatmem_config::QueueConfig;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::time::Duration;

/// Removes the oldest (lowest-score) members beyond `max_length`.
/// Runs server-side so concurrent appends cannot race the count check.
const LENGTH_TRIM_SCRIPT: &str = r#"
local queue_key = KEYS[1]
local max_length = tonumber(ARGV[1])

local queue_length = redis.call('ZCARD', queue_key)

local trimmed = 0
if queue_length > max_length then
    local excess = queue_length - max_length
    trimmed = redis.call('ZREMRANGEBYRANK', queue_key, 0, excess - 1)
end

return trimmed
"#;

/// Range-by-score read returning members with their scores in one round
/// trip; `limit <= 0` means unbounded.
const RANGE_WITH_SCORES_SCRIPT: &str = r#"
local queue_key = KEYS[1]
local min_score = ARGV[1]
local max_score = ARGV[2]
local limit = tonumber(ARGV[3]) or -1

if limit > 0 then
    return redis.call('ZRANGEBYSCORE', queue_key, min_score, max_score, 'WITHSCORES', 'LIMIT', 0, limit)
end
return redis.call('ZRANGEBYSCORE', queue_key, min_score, max_score, 'WITHSCORES')
"#;

/// One decoded queue entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub payload: QueuePayload,
    /// Milliseconds since epoch (or the caller-supplied ordering key)
    pub score: i64,
}

/// Snapshot of a queue's state
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub total_count: usize,
    pub max_length: usize,
    pub oldest_score: Option<i64>,
    pub newest_score: Option<i64>,
    /// Seconds until the key expires; negative when absent or persistent
    pub ttl_seconds: i64,
    pub is_full: bool,
}

/// Bounded-queue contract consumed by the memorize pipeline
///
/// Kept as a trait so the pipeline can run against an in-memory double in
/// tests; the Redis implementation is the production one.
#[async_trait]
pub trait BufferCache: Send + Sync {
    /// Append a payload at `score` (defaults to now in epoch millis),
    /// refreshing the queue TTL
    async fn append(
        &self,
        key: &str,
        payload: &QueuePayload,
        score: Option<i64>,
    ) -> Result<(), CacheError>;

    /// Re-append previously read items, preserving ids and scores
    async fn restore(&self, key: &str, items: &[QueueItem]) -> Result<(), CacheError>;

    /// Current cardinality; 0 when the key is absent
    async fn size(&self, key: &str) -> Result<usize, CacheError>;

    /// Delete the queue entirely
    async fn clear(&self, key: &str) -> Result<bool, CacheError>;

    /// Force a full trim to the configured bound; returns removed count
    async fn trim_excess(&self, key: &str) -> Result<u64, CacheError>;

    /// Items with score in `[start, end]`, newest first, up to `limit`
    async fn range_by_timestamp(
        &self,
        key: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<QueueItem>, CacheError>;

    /// Same range read, oldest first; the pipeline replays buffers with it
    async fn range_ascending(
        &self,
        key: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<QueueItem>, CacheError>;

    /// Queue statistics snapshot
    async fn stats(&self, key: &str) -> Result<QueueStats, CacheError>;
}

/// Bounded, score-ordered queue cache
///
/// Append refreshes the key TTL; a queue untouched for `expire_minutes`
/// may be dropped by Redis. The `max_length` bound is enforced by a
/// probabilistic trim on append and restored exactly by `trim_excess`.
#[derive(Clone)]
pub struct BoundedQueueCache {
    conn: MultiplexedConnection,
    config: QueueConfig,
    trim_script: Script,
    range_script: Script,
}

impl BoundedQueueCache {
    pub fn new(conn: MultiplexedConnection, config: QueueConfig) -> Self {
        Self {
            conn,
            config,
            trim_script: Script::new(LENGTH_TRIM_SCRIPT),
            range_script: Script::new(RANGE_WITH_SCORES_SCRIPT),
        }
    }

    /// Connect to Redis and build the cache
    pub async fn connect(url: &str, config: QueueConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::from)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(CacheError::from)?;
        tracing::info!(max_length = config.max_length, expire_minutes = config.expire_minutes, "queue cache connected");
        Ok(Self::new(conn, config))
    }

    pub fn max_length(&self) -> usize {
        self.config.max_length
    }
}

#[async_trait]
impl BufferCache for BoundedQueueCache {
    /// Append succeeds only when both the add and the TTL refresh succeed;
    /// with probability `cleanup_probability` it also trims the queue.
    async fn append(
        &self,
        key: &str,
        payload: &QueuePayload,
        score: Option<i64>,
    ) -> Result<(), CacheError> {
        let score = score.unwrap_or_else(|| Utc::now().timestamp_millis());
        let member = payload.encode();
        let expire_seconds = (self.config.expire_minutes * 60) as i64;

        let mut conn = self.conn.clone();
        let added: i64 = self
            .with_timeout(conn.zadd(key, member.as_str(), score))
            .await?;
        let expired: bool = self.with_timeout(conn.expire(key, expire_seconds)).await?;
        if !expired {
            return Err(CacheError::Connection(format!(
                "ttl refresh failed for {key}"
            )));
        }

        let trimmed = self.trim_if_sampled(key).await?;
        tracing::debug!(
            key,
            score,
            added,
            trimmed,
            member_len = member.len(),
            "queue append"
        );
        Ok(())
    }

    /// Used after an emitted segment is sliced off the front of a buffer
    async fn restore(&self, key: &str, items: &[QueueItem]) -> Result<(), CacheError> {
        let expire_seconds = (self.config.expire_minutes * 60) as i64;
        let mut conn = self.conn.clone();

        for item in items {
            let member = item.payload.encode_with_id(&item.id);
            let _: i64 = self
                .with_timeout(conn.zadd(key, member.as_str(), item.score))
                .await?;
        }
        if !items.is_empty() {
            let expired: bool = self.with_timeout(conn.expire(key, expire_seconds)).await?;
            if !expired {
                return Err(CacheError::Connection(format!(
                    "ttl refresh failed for {key}"
                )));
            }
        }
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<usize, CacheError> {
        let mut conn = self.conn.clone();
        let size: usize = self.with_timeout(conn.zcard(key)).await?;
        Ok(size)
    }

    async fn clear(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.with_timeout(conn.del(key)).await?;
        tracing::debug!(key, removed, "queue cleared");
        Ok(removed > 0)
    }

    /// Restores the length bound exactly, regardless of append sampling
    async fn trim_excess(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let trimmed: u64 = self
            .with_timeout(
                self.trim_script
                    .key(key)
                    .arg(self.config.max_length)
                    .invoke_async(&mut conn),
            )
            .await?;
        if trimmed > 0 {
            tracing::info!(key, trimmed, "trimmed oldest queue entries");
        }
        Ok(trimmed)
    }

    /// Malformed members are logged and skipped, never surfaced
    async fn range_by_timestamp(
        &self,
        key: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<QueueItem>, CacheError> {
        let mut items = self.range_ascending(key, start, end, limit).await?;
        items.reverse();
        Ok(items)
    }

    async fn range_ascending(
        &self,
        key: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<QueueItem>, CacheError> {
        let min_score = start.map_or_else(|| "-inf".to_string(), |s| s.to_string());
        let max_score = end.map_or_else(|| "+inf".to_string(), |s| s.to_string());
        let limit_arg: i64 = limit.map_or(-1, |l| l as i64);

        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = self
            .with_timeout(
                self.range_script
                    .key(key)
                    .arg(&min_score)
                    .arg(&max_score)
                    .arg(limit_arg)
                    .invoke_async(&mut conn),
            )
            .await?;

        let mut items = Vec::with_capacity(raw.len());
        for (member, score) in raw {
            match QueuePayload::decode(&member) {
                Ok((id, payload)) => items.push(QueueItem {
                    id,
                    payload,
                    score: score as i64,
                }),
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping malformed queue member");
                }
            }
        }

        // ZRANGEBYSCORE is ascending; insertion order within equal scores
        // is preserved by the set's lexical tie-break at append time.
        Ok(items)
    }

    async fn stats(&self, key: &str) -> Result<QueueStats, CacheError> {
        let mut conn = self.conn.clone();
        let total_count: usize = self.with_timeout(conn.zcard(key)).await?;

        if total_count == 0 {
            return Ok(QueueStats {
                total_count: 0,
                max_length: self.config.max_length,
                oldest_score: None,
                newest_score: None,
                ttl_seconds: -2,
                is_full: false,
            });
        }

        let oldest: Vec<(String, f64)> =
            self.with_timeout(conn.zrange_withscores(key, 0, 0)).await?;
        let newest: Vec<(String, f64)> = self
            .with_timeout(conn.zrange_withscores(key, -1, -1))
            .await?;
        let ttl_seconds: i64 = self.with_timeout(conn.ttl(key)).await?;

        Ok(QueueStats {
            total_count,
            max_length: self.config.max_length,
            oldest_score: oldest.first().map(|(_, s)| *s as i64),
            newest_score: newest.first().map(|(_, s)| *s as i64),
            ttl_seconds,
            is_full: total_count >= self.config.max_length,
        })
    }
}

impl BoundedQueueCache {
    async fn trim_if_sampled(&self, key: &str) -> Result<u64, CacheError> {
        if rand::random::<f64>() >= self.config.cleanup_probability {
            return Ok(0);
        }
        self.trim_excess(key).await
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(Duration::from_secs(self.config.timeout_s), fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.config.timeout_s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_script_removes_lowest_ranks() {
        // The script must delete from rank 0 (oldest by score) upward
        assert!(LENGTH_TRIM_SCRIPT.contains("ZREMRANGEBYRANK"));
        assert!(LENGTH_TRIM_SCRIPT.contains("excess - 1"));
    }

    #[test]
    fn test_range_script_carries_scores() {
        assert!(RANGE_WITH_SCORES_SCRIPT.contains("WITHSCORES"));
        assert!(RANGE_WITH_SCORES_SCRIPT.contains("LIMIT"));
    }

    #[test]
    fn test_default_config_bounds() {
        let config = QueueConfig::default();
        assert_eq!(config.max_length, 100);
        assert_eq!(config.expire_minutes, 60);
        assert!((config.cleanup_probability - 0.1).abs() < 1e-9);
    }
}
