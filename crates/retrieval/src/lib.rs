//! Retrieval engines
//!
//! - `HybridRetriever`: BM25, vector, and RRF-fused search over the same
//!   logical collection, with scoping and time filters
//! - `AgenticRetriever`: two-round retrieval where an LLM judges whether
//!   the first pass sufficed and issues refined follow-up queries

pub mod agentic;
pub mod hybrid;

pub use agentic::{AgenticRequest, AgenticRetriever};
pub use hybrid::{HybridRetriever, Retriever, SearchRequest};

use thiserror::Error;

/// Retrieval errors
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("storage error: {0}")]
    Storage(#[from] chatmem_storage::StorageError),

    #[error("llm error: {0}")]
    Llm(#[from] chatmem_llm::LlmError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timeout: {0}")]
    Timeout(String),
}
