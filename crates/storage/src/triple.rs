//! Triple-store writer
//!
//! Writes one record synchronously into the document store, the vector
//! index, and the text index. The document store is the source of truth
//! and is written first; if a later step fails, compensating deletes
//! remove everything already written. Only when a compensating delete
//! itself fails does the caller see `PartialWrite`, which names the
//! backends an offline repair job must sweep.

use crate::records::RecordStore;
use crate::text_index::TextIndex;
use crate::vector_index::VectorIndex;
use crate::{Backend, DeleteFilter, StorageError};
use chatmem_core::MemoryRecord;
use chatmem_llm::Embedder;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a successful triple write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub event_id: String,
}

/// Coordinates writes across the three backends
pub struct TripleStoreWriter {
    records: Arc<dyn RecordStore>,
    text: Arc<dyn TextIndex>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl TripleStoreWriter {
    pub fn new(
        records: Arc<dyn RecordStore>,
        text: Arc<dyn TextIndex>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            records,
            text,
            vectors,
            embedder,
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Write a record to all three backends.
    ///
    /// Assigns the event id when the record carries none. Order: document
    /// store, embedding + vector index, text index. A document-store
    /// failure fails fast; later failures roll back what was written.
    pub async fn write(&self, mut record: MemoryRecord) -> Result<WriteReceipt, StorageError> {
        if record.event_id.is_empty() {
            record.event_id = Uuid::new_v4().to_string();
        }
        record.updated_at = Utc::now();
        let event_id = record.event_id.clone();

        // Step 1: source of truth
        self.records.insert(&record).await?;

        // Step 2: embedding + vector index
        let embedding = match self.embedder.embed(&record.search_text()).await {
            Ok(embedding) => embedding,
            Err(e) => {
                return Err(self
                    .compensate(&event_id, &[Backend::DocumentStore], e.into())
                    .await);
            }
        };
        if let Err(e) = self.vectors.upsert(&record, embedding).await {
            return Err(self
                .compensate(&event_id, &[Backend::DocumentStore], e)
                .await);
        }

        // Step 3: text index
        if let Err(e) = self.text.index_record(&record).await {
            return Err(self
                .compensate(
                    &event_id,
                    &[Backend::DocumentStore, Backend::VectorIndex],
                    e,
                )
                .await);
        }

        tracing::info!(event_id = %event_id, kind = record.record_type.as_str(), "record written to all backends");
        Ok(WriteReceipt { event_id })
    }

    /// Remove a record from every backend. Returns whether the document
    /// store held it. Index deletes that fail are surfaced after all
    /// backends were attempted.
    pub async fn delete_by_event_id(&self, event_id: &str) -> Result<bool, StorageError> {
        let mut first_error: Option<StorageError> = None;

        let found = match self.records.delete_by_event_id(event_id).await {
            Ok(found) => found,
            Err(e) => {
                first_error = Some(e);
                false
            }
        };
        if let Err(e) = self.text.delete_by_event_id(event_id).await {
            tracing::error!(event_id, error = %e, "text index delete failed");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.vectors.delete_by_event_id(event_id).await {
            tracing::error!(event_id, error = %e, "vector index delete failed");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(found),
        }
    }

    /// Bulk delete across all backends; the document-store count is the
    /// authoritative return value.
    pub async fn delete_by_filters(&self, filter: &DeleteFilter) -> Result<u64, StorageError> {
        filter.validate()?;

        let mut first_error: Option<StorageError> = None;

        let deleted = match self.records.delete_by_filters(filter).await {
            Ok(count) => count,
            Err(e) => {
                first_error = Some(e);
                0
            }
        };
        if let Err(e) = self.text.delete_by_filters(filter).await {
            tracing::error!(error = %e, "text index filter delete failed");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.vectors.delete_by_filters(filter).await {
            tracing::error!(error = %e, "vector index filter delete failed");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    /// Best-effort rollback of backends already written. Returns the error
    /// the caller should see: the original failure when rollback completed,
    /// `PartialWrite` naming the survivors when it did not.
    async fn compensate(
        &self,
        event_id: &str,
        written: &[Backend],
        original: StorageError,
    ) -> StorageError {
        let mut surviving = Vec::new();

        for backend in written {
            let result = match backend {
                Backend::DocumentStore => self
                    .records
                    .delete_by_event_id(event_id)
                    .await
                    .map(|_| ()),
                Backend::TextIndex => self.text.delete_by_event_id(event_id).await,
                Backend::VectorIndex => self.vectors.delete_by_event_id(event_id).await,
            };
            if let Err(e) = result {
                tracing::error!(
                    event_id,
                    backend = backend.as_str(),
                    error = %e,
                    "compensating delete failed; offline repair required"
                );
                surviving.push(*backend);
            }
        }

        if surviving.is_empty() {
            tracing::warn!(event_id, error = %original, "triple write rolled back");
            original
        } else {
            StorageError::PartialWrite {
                event_id: event_id.to_string(),
                surviving,
            }
        }
    }
}
