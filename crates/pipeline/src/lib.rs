//! Memorize pipeline and its dispatcher
//!
//! `GroupDispatcher` hash-routes inbound messages onto N worker queues
//! with a global in-flight cap; `MemorizePipeline` runs the per-group
//! buffer → boundary → extract → persist flow under a per-group lock, so
//! one group's extraction can never run twice concurrently and messages
//! of a group are processed in arrival order.

pub mod dispatcher;
pub mod memorize;

pub use dispatcher::{
    DeliveryStatus, GroupDispatcher, MessageProcessor, QueueStatsSnapshot,
};
pub use memorize::{MemorizePipeline, ProcessOutcome};

use thiserror::Error;

/// Pipeline errors; buffer failures are retriable by the caller
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("buffer unavailable: {0}")]
    Buffer(#[from] chatmem_cache::CacheError),

    #[error("storage error: {0}")]
    Storage(#[from] chatmem_storage::StorageError),

    #[error("worker gone before replying")]
    WorkerGone,
}
