//! Vector index using Qdrant
//!
//! Dense side of the triple store: cosine kNN over record embeddings, with
//! the same scope and time filters the text index applies. Point ids are
//! the record event ids, so compensating deletes address both indices the
//! same way.

use crate::{DeleteFilter, IndexFilter, IndexHit, StorageError};
use async_trait::async_trait;
use chatmem_core::MemoryRecord;
use qdrant_client::qdrant::{
    value::Kind, Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointId, PointStruct, PointsIdsList, Range, ScoredPoint, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use chatmem_config::VectorIndexConfig;

/// Vector index contract
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert one record with its embedding
    async fn upsert(&self, record: &MemoryRecord, embedding: Vec<f32>)
        -> Result<(), StorageError>;

    /// Cosine kNN with scope/time filters
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, StorageError>;

    async fn delete_by_event_id(&self, event_id: &str) -> Result<(), StorageError>;

    async fn delete_by_filters(&self, filter: &DeleteFilter) -> Result<(), StorageError>;
}

/// Qdrant-backed vector index
pub struct QdrantVectorIndex {
    client: Qdrant,
    config: VectorIndexConfig,
    vector_dim: usize,
}

impl QdrantVectorIndex {
    pub async fn connect(
        config: VectorIndexConfig,
        vector_dim: usize,
    ) -> Result<Self, StorageError> {
        let mut builder = Qdrant::from_url(&config.endpoint);
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            vector_dim,
        })
    }

    /// Create the collection if it does not exist
    pub async fn ensure_collection(&self) -> Result<(), StorageError> {
        let exists = self
            .client
            .collection_exists(&self.config.collection)
            .await
            .map_err(|e| StorageError::VectorStore(e.to_string()))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.config.collection).vectors_config(
                        VectorParamsBuilder::new(self.vector_dim as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| StorageError::VectorStore(e.to_string()))?;
            tracing::info!(collection = %self.config.collection, dim = self.vector_dim, "vector collection created");
        }

        Ok(())
    }

    fn build_filter(&self, filter: &IndexFilter) -> Option<Filter> {
        let mut must: Vec<Condition> = Vec::new();

        let user_cond = filter
            .user_id
            .as_ref()
            .map(|u| Condition::matches("user_id", u.clone()));
        let group_cond = filter
            .group_id
            .as_ref()
            .filter(|g| !g.is_empty())
            .map(|g| Condition::matches("group_id", g.clone()));

        match (user_cond, group_cond, filter.any_scope) {
            (Some(u), Some(g), true) => {
                // At-least-one semantics need a nested should filter; a
                // top-level should next to must clauses is only a boost
                must.push(Condition::from(Filter::should([u, g])));
            }
            (u, g, _) => {
                must.extend(u);
                must.extend(g);
            }
        }

        if let Some(kind) = filter.record_type {
            must.push(Condition::matches("record_type", kind.as_str().to_string()));
        }

        if filter.start_ms.is_some() || filter.end_ms.is_some() {
            must.push(Condition::range(
                "timestamp_ms",
                Range {
                    gte: filter.start_ms.map(|v| v as f64),
                    lte: filter.end_ms.map(|v| v as f64),
                    ..Range::default()
                },
            ));
        }

        if must.is_empty() {
            None
        } else {
            Some(Filter::must(must))
        }
    }

    fn point_to_hit(point: ScoredPoint) -> IndexHit {
        let mut hit = IndexHit {
            event_id: String::new(),
            score: point.score,
            subject: String::new(),
            summary: String::new(),
            episode: String::new(),
            timestamp_ms: 0,
            tz_offset_secs: 0,
            start_ms: None,
            end_ms: None,
        };

        for (key, value) in point.payload {
            match (key.as_str(), value.kind) {
                ("event_id", Some(Kind::StringValue(s))) => hit.event_id = s,
                ("subject", Some(Kind::StringValue(s))) => hit.subject = s,
                ("summary", Some(Kind::StringValue(s))) => hit.summary = s,
                ("episode", Some(Kind::StringValue(s))) => hit.episode = s,
                ("timestamp_ms", Some(Kind::IntegerValue(i))) => hit.timestamp_ms = i,
                ("tz_offset_secs", Some(Kind::IntegerValue(i))) => hit.tz_offset_secs = i as i32,
                ("start_ms", Some(Kind::IntegerValue(i))) => hit.start_ms = Some(i),
                ("end_ms", Some(Kind::IntegerValue(i))) => hit.end_ms = Some(i),
                _ => {}
            }
        }

        // Fall back to the point id when the payload lacks the event id
        if hit.event_id.is_empty() {
            if let Some(pid) = point.id {
                if let Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u)) =
                    pid.point_id_options
                {
                    hit.event_id = u;
                }
            }
        }

        hit
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn upsert(
        &self,
        record: &MemoryRecord,
        embedding: Vec<f32>,
    ) -> Result<(), StorageError> {
        let mut payload_json = serde_json::json!({
            "event_id": record.event_id,
            "user_id": record.user_id,
            "group_id": record.group_id,
            "record_type": record.record_type.as_str(),
            "subject": record.subject,
            "summary": record.summary,
            "episode": record.episode,
            "timestamp_ms": record.timestamp.timestamp_millis(),
            "tz_offset_secs": record.timestamp.offset().local_minus_utc(),
        });
        if let Some(start) = record.start_time {
            payload_json["start_ms"] = serde_json::json!(start.timestamp_millis());
        }
        if let Some(end) = record.end_time {
            payload_json["end_ms"] = serde_json::json!(end.timestamp_millis());
        }

        let payload = Payload::try_from(payload_json)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let point = PointStruct::new(record.event_id.clone(), embedding, payload);
        self.client
            .upsert_points(UpsertPointsBuilder::new(
                &self.config.collection,
                vec![point],
            ))
            .await
            .map_err(|e| StorageError::VectorStore(e.to_string()))?;

        tracing::debug!(event_id = %record.event_id, "record upserted into vector index");
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>, StorageError> {
        let mut builder = SearchPointsBuilder::new(
            &self.config.collection,
            embedding.to_vec(),
            limit as u64,
        )
        .with_payload(true);

        if let Some(qdrant_filter) = self.build_filter(filter) {
            builder = builder.filter(qdrant_filter);
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| StorageError::Search(e.to_string()))?;

        Ok(response
            .result
            .into_iter()
            .map(Self::point_to_hit)
            .collect())
    }

    async fn delete_by_event_id(&self, event_id: &str) -> Result<(), StorageError> {
        let ids = PointsIdsList {
            ids: vec![PointId::from(event_id.to_string())],
        };
        self.client
            .delete_points(DeletePointsBuilder::new(&self.config.collection).points(ids))
            .await
            .map_err(|e| StorageError::VectorStore(e.to_string()))?;
        Ok(())
    }

    async fn delete_by_filters(&self, filter: &DeleteFilter) -> Result<(), StorageError> {
        filter.validate()?;

        let index_filter = IndexFilter {
            user_id: filter.user_id.clone(),
            group_id: filter.group_id.clone(),
            any_scope: filter.user_id.is_some() && filter.group_id.is_some(),
            record_type: None,
            start_ms: filter.start_ms,
            end_ms: filter.end_ms,
        };
        let Some(qdrant_filter) = self.build_filter(&index_filter) else {
            return Err(StorageError::InvalidFilter(
                "vector delete requires at least one condition".into(),
            ));
        };

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.config.collection).points(qdrant_filter),
            )
            .await
            .map_err(|e| StorageError::VectorStore(e.to_string()))?;

        tracing::info!("vector index entries deleted by filter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> QdrantVectorIndex {
        // Built without connecting; only filter construction is exercised
        QdrantVectorIndex {
            client: Qdrant::from_url("http://localhost:6334").build().unwrap(),
            config: VectorIndexConfig::default(),
            vector_dim: 8,
        }
    }

    #[test]
    fn test_empty_filter_builds_none() {
        assert!(index().build_filter(&IndexFilter::default()).is_none());
    }

    #[test]
    fn test_scoped_filter_builds_must_conditions() {
        let filter = index()
            .build_filter(&IndexFilter {
                user_id: Some("u1".into()),
                start_ms: Some(0),
                end_ms: Some(100),
                ..IndexFilter::default()
            })
            .unwrap();
        // user match + timestamp range
        assert_eq!(filter.must.len(), 2);
        assert!(filter.should.is_empty());
    }

    #[test]
    fn test_union_scope_nests_should_filter() {
        let filter = index()
            .build_filter(&IndexFilter {
                user_id: Some("u1".into()),
                group_id: Some("g1".into()),
                any_scope: true,
                ..IndexFilter::default()
            })
            .unwrap();
        // One nested should-filter condition, not two top-level musts
        assert_eq!(filter.must.len(), 1);
    }
}
