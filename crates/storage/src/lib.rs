//! Storage layer: document store, text index, vector index
//!
//! One logical `MemoryRecord` lives in three places: ScyllaDB is the source
//! of truth, Tantivy serves BM25 keyword search, Qdrant serves vector
//! search. `TripleStoreWriter` keeps the three consistent per event id with
//! compensating deletes on partial failure.
//!
//! Every backend sits behind a trait so the writer and the retriever can
//! be exercised against in-memory fakes.

pub mod client;
pub mod meta;
pub mod profiles;
pub mod records;
pub mod schema;
pub mod text_index;
pub mod triple;
pub mod vector_index;

pub use client::ScyllaClient;
pub use meta::{ConversationMetaStore, ScyllaConversationMetaStore};
pub use profiles::{GroupProfileStore, ScyllaGroupProfileStore};
pub use records::{FetchPage, RecordStore, ScyllaRecordStore, SortOrder};
pub use text_index::{TantivyTextIndex, TextIndex, TextSearchParams};
pub use triple::{TripleStoreWriter, WriteReceipt};
pub use vector_index::{QdrantVectorIndex, VectorIndex};

use chrono::{DateTime, FixedOffset, TimeZone};
use thiserror::Error;

/// The three physical backends of the triple store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    DocumentStore,
    TextIndex,
    VectorIndex,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentStore => "document_store",
            Self::TextIndex => "text_index",
            Self::VectorIndex => "vector_index",
        }
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("schema error: {0}")]
    Schema(String),

    /// A write landed in some backends and the compensating delete could
    /// not remove all of them; an offline repair job must sweep
    #[error("partial write for {event_id}: record survives in {surviving:?}")]
    PartialWrite {
        event_id: String,
        surviving: Vec<Backend>,
    },
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<chatmem_llm::LlmError> for StorageError {
    fn from(err: chatmem_llm::LlmError) -> Self {
        StorageError::Embedding(err.to_string())
    }
}

/// One hit from a search index, hydrated from the index payload
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub event_id: String,
    pub score: f32,
    pub subject: String,
    pub summary: String,
    pub episode: String,
    pub timestamp_ms: i64,
    pub tz_offset_secs: i32,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl IndexHit {
    /// Reconstruct the record timestamp with its original offset
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(self.tz_offset_secs)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
        offset
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .unwrap_or_else(|| offset.timestamp_millis_opt(0).single().expect("epoch"))
    }
}

/// Scope and time constraints applied inside a search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexFilter {
    /// Match records owned by this user; `Some("")` selects group-only
    /// records (the stored user_id is empty for those)
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    /// Combine the user/group conditions with OR instead of AND; used by
    /// the `all` scope to union personal and group memories
    pub any_scope: bool,
    pub record_type: Option<chatmem_core::RecordType>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl IndexFilter {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.group_id.is_none()
            && self.record_type.is_none()
            && self.start_ms.is_none()
            && self.end_ms.is_none()
    }
}

/// Constraints for bulk deletes; at least one of user/group must be set so
/// a blank filter can never wipe a collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteFilter {
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl DeleteFilter {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.user_id.is_none() && self.group_id.is_none() {
            return Err(StorageError::InvalidFilter(
                "delete requires user_id or group_id".into(),
            ));
        }
        Ok(())
    }
}
