//! Boundary detection and memory extraction
//!
//! Three LLM-driven steps turn a buffered conversation into persisted
//! memory:
//! 1. `BoundaryDetector` decides whether the buffer forms a closed segment
//! 2. `MemCellExtractor` condenses a closed segment into one MemCell
//! 3. `EpisodeExtractor` summarizes batches of MemCells into an Episode
//!
//! All three use constrained-JSON prompts; unparseable responses never
//! crash the pipeline, they degrade to "wait" or an extraction error the
//! worker logs and moves past.

pub mod boundary;
pub mod episode;
pub mod memcell;
pub mod prompts;

pub use boundary::{BoundaryDecision, BoundaryDetector};
pub use episode::EpisodeExtractor;
pub use memcell::MemCellExtractor;

use thiserror::Error;

/// Extraction errors
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("llm error: {0}")]
    Llm(#[from] chatmem_llm::LlmError),

    #[error("invalid llm response: {0}")]
    InvalidResponse(String),

    #[error("empty segment")]
    EmptySegment,
}
