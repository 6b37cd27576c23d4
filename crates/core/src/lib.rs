//! Core types for the chatmem memory service
//!
//! This crate provides the foundational types shared by every other crate:
//! - Inbound message and episode segment types
//! - The persisted memory record model (MemCells, Episodes, profiles)
//! - Retrieval request/response shapes
//! - The smart text scorer used for multi-term query boosting
//!
//! Failures are typed per layer (`CacheError`, `LlmError`, and so on in
//! their crates); this crate stays error-free so every other crate can
//! depend on it without cycles.

pub mod message;
pub mod record;
pub mod retrieval;
pub mod text;

pub use message::{EpisodeSegment, RawMessage, Scene};
pub use record::{
    ConversationMeta, GroupProfile, MemoryRecord, RecordType, UserDetail,
};
pub use retrieval::{
    MemoryScope, RetrievalMode, RetrievalResult, RetrievalResults, TimeRange,
};
pub use text::{SmartTextScorer, TextToken, TokenKind, TokenWeights};
