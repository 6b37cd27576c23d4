//! Hybrid retrieval over a real in-memory text index
//!
//! The BM25 side runs against an actual Tantivy index; the vector side and
//! the embedder are scripted. This exercises term weighting, scope
//! filtering, and RRF fusion the way the server wires them.

use async_trait::async_trait;
use chatmem_config::RetrievalConfig;
use chatmem_core::{MemoryRecord, MemoryScope, RecordType, RetrievalMode};
use chatmem_llm::{Embedder, LlmError};
use chatmem_retrieval::{HybridRetriever, Retriever, SearchRequest};
use chatmem_storage::{
    DeleteFilter, IndexFilter, IndexHit, StorageError, TantivyTextIndex, TextIndex, VectorIndex,
};
use chrono::{FixedOffset, TimeZone, Utc};
use std::sync::Arc;

fn record(event_id: &str, user_id: &str, group_id: &str, subject: &str, summary: &str, hour: u32) -> MemoryRecord {
    let now = Utc::now();
    MemoryRecord {
        event_id: event_id.into(),
        user_id: user_id.into(),
        group_id: group_id.into(),
        participants: vec!["alice".into(), "bob".into()],
        timestamp: FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, hour, 0, 0)
            .unwrap(),
        record_type: RecordType::Conversation,
        subject: subject.into(),
        summary: summary.into(),
        keywords: Vec::new(),
        linked_entities: Vec::new(),
        original_data: Vec::new(),
        memcell_event_id_list: Vec::new(),
        episode: String::new(),
        start_time: None,
        end_time: None,
        created_at: now,
        updated_at: now,
    }
}

/// Vector side returning a fixed ranking
struct ScriptedVectors {
    hits: Vec<IndexHit>,
}

#[async_trait]
impl VectorIndex for ScriptedVectors {
    async fn upsert(&self, _: &MemoryRecord, _: Vec<f32>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn search(
        &self,
        _: &[f32],
        limit: usize,
        _: &IndexFilter,
    ) -> Result<Vec<IndexHit>, StorageError> {
        Ok(self.hits.iter().take(limit).cloned().collect())
    }

    async fn delete_by_event_id(&self, _: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete_by_filters(&self, _: &DeleteFilter) -> Result<(), StorageError> {
        Ok(())
    }
}

struct ZeroEmbedder;

#[async_trait]
impl Embedder for ZeroEmbedder {
    async fn embed(&self, _: &str) -> Result<Vec<f32>, LlmError> {
        Ok(vec![0.0; 8])
    }

    fn dim(&self) -> usize {
        8
    }
}

fn vector_hit(event_id: &str, score: f32) -> IndexHit {
    IndexHit {
        event_id: event_id.into(),
        score,
        subject: format!("subject {event_id}"),
        summary: String::new(),
        episode: String::new(),
        timestamp_ms: 1_717_200_000_000,
        tz_offset_secs: 0,
        start_ms: None,
        end_ms: None,
    }
}

async fn seeded_index() -> Arc<TantivyTextIndex> {
    let index = TantivyTextIndex::in_ram().unwrap();
    index
        .index_record(&record(
            "coffee-note",
            "u1",
            "",
            "Coffee preferences",
            "Alice prefers a light roast pour-over in the morning.",
            9,
        ))
        .await
        .unwrap();
    index
        .index_record(&record(
            "travel-note",
            "u1",
            "",
            "Trip to Rome",
            "Bob booked flights to Rome for the October offsite.",
            11,
        ))
        .await
        .unwrap();
    index
        .index_record(&record(
            "group-note",
            "",
            "g1",
            "Standup summary",
            "The team agreed to ship the search feature on Friday.",
            14,
        ))
        .await
        .unwrap();
    Arc::new(index)
}

#[tokio::test]
async fn bm25_search_finds_matching_record() {
    let text = seeded_index().await;
    let retriever = HybridRetriever::new(
        text,
        Arc::new(ScriptedVectors { hits: Vec::new() }),
        Arc::new(ZeroEmbedder),
        RetrievalConfig::default(),
    );

    let response = retriever
        .search(&SearchRequest {
            mode: RetrievalMode::Bm25,
            scope: MemoryScope::Personal,
            ..SearchRequest::new("coffee roast", "u1")
        })
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].event_id, "coffee-note");
    assert!(response.results[0].score > 0.0);
    assert_eq!(
        response.results[0].subject,
        "Coffee preferences"
    );
}

#[tokio::test]
async fn scope_union_covers_personal_and_group() {
    let text = seeded_index().await;
    let retriever = HybridRetriever::new(
        text,
        Arc::new(ScriptedVectors { hits: Vec::new() }),
        Arc::new(ZeroEmbedder),
        RetrievalConfig::default(),
    );

    // "ship"/"search" match the group note; "coffee" the personal one
    let response = retriever
        .search(&SearchRequest {
            mode: RetrievalMode::Bm25,
            scope: MemoryScope::All,
            group_id: Some("g1".into()),
            ..SearchRequest::new("coffee search feature", "u1")
        })
        .await
        .unwrap();

    let ids: Vec<&str> = response.results.iter().map(|r| r.event_id.as_str()).collect();
    assert!(ids.contains(&"coffee-note"));
    assert!(ids.contains(&"group-note"));
}

#[tokio::test]
async fn rrf_prefers_records_on_both_sides() {
    let text = seeded_index().await;
    // The vector side ranks the travel note first and also knows the
    // coffee note
    let retriever = HybridRetriever::new(
        text,
        Arc::new(ScriptedVectors {
            hits: vec![vector_hit("travel-note", 0.9), vector_hit("coffee-note", 0.5)],
        }),
        Arc::new(ZeroEmbedder),
        RetrievalConfig::default(),
    );

    let response = retriever
        .search(&SearchRequest {
            mode: RetrievalMode::Rrf,
            scope: MemoryScope::Personal,
            ..SearchRequest::new("coffee", "u1")
        })
        .await
        .unwrap();

    // coffee-note appears in both lists, travel-note only in one
    assert_eq!(response.results[0].event_id, "coffee-note");
    assert!(response
        .results
        .iter()
        .any(|r| r.event_id == "travel-note"));
    assert_eq!(
        response.metadata.get("retrieval_mode").unwrap(),
        &serde_json::json!("rrf")
    );
    assert!(response.metadata.contains_key("bm25_count"));
}

#[tokio::test]
async fn empty_query_lists_newest_first() {
    let text = seeded_index().await;
    let retriever = HybridRetriever::new(
        text,
        Arc::new(ScriptedVectors { hits: Vec::new() }),
        Arc::new(ZeroEmbedder),
        RetrievalConfig::default(),
    );

    let response = retriever
        .search(&SearchRequest {
            mode: RetrievalMode::Rrf,
            scope: MemoryScope::Personal,
            ..SearchRequest::new("", "u1")
        })
        .await
        .unwrap();

    let ids: Vec<&str> = response.results.iter().map(|r| r.event_id.as_str()).collect();
    assert_eq!(ids, vec!["travel-note", "coffee-note"]);
}
