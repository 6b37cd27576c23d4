//! Retrieval request/response shapes

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which retrieval engine answers a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Keyword search over the text index
    Bm25,
    /// Cosine kNN over the vector index
    Embedding,
    /// Reciprocal-rank fusion of both
    #[default]
    Rrf,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bm25 => "bm25",
            Self::Embedding => "embedding",
            Self::Rrf => "rrf",
        }
    }
}

/// Visibility scope of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// Personal plus group records
    #[default]
    All,
    /// Records whose user_id equals the requester
    Personal,
    /// Records belonging to the requested group
    Group,
}

/// Closed timestamp interval filter; either bound may be open
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<FixedOffset>>,
}

impl TimeRange {
    /// Whether a timestamp falls inside the (possibly half-open) range
    pub fn contains(&self, ts: DateTime<FixedOffset>) -> bool {
        if let Some(start) = self.start {
            if ts < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if ts > end {
                return false;
            }
        }
        true
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// One retrieved record
///
/// `score` magnitudes are backend-specific and only comparable within a
/// single response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub event_id: String,
    pub score: f32,
    pub subject: String,
    pub summary: String,
    #[serde(default)]
    pub episode: String,
    pub timestamp: DateTime<FixedOffset>,
}

/// A retrieval response: ranked results plus flat response metadata
/// (retrieval_mode, total_latency_ms, round counts, reasoning, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResults {
    pub results: Vec<RetrievalResult>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RetrievalResults {
    pub fn empty_with_reason(reason: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("reasoning".to_string(), serde_json::json!(reason));
        Self {
            results: Vec::new(),
            metadata,
        }
    }

    pub fn set_meta(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }
}
