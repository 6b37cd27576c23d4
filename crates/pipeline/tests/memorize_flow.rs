//! End-to-end memorize flow over an in-memory buffer
//!
//! Drives the full pipeline — buffer, boundary detection, extraction,
//! triple write, episode batching — with scripted LLM responses and
//! in-memory backends. Covers the accumulate-then-extract sequence, the
//! silence hard-cut, write-failure retry, and episode derivation.

use async_trait::async_trait;
use chatmem_cache::{BufferCache, CacheError, QueueItem, QueuePayload, QueueStats};
use chatmem_config::BoundaryConfig;
use chatmem_core::{MemoryRecord, RawMessage, RecordType, Scene};
use chatmem_extraction::{BoundaryDetector, EpisodeExtractor, MemCellExtractor};
use chatmem_llm::{Embedder, GenerationResult, LlmBackend, LlmError, Message};
use chatmem_pipeline::{MemorizePipeline, MessageProcessor, ProcessOutcome};
use chatmem_storage::{
    DeleteFilter, FetchPage, IndexFilter, IndexHit, RecordStore, SortOrder, StorageError,
    TextIndex, TextSearchParams, TripleStoreWriter, VectorIndex,
};
use chrono::{FixedOffset, TimeZone};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// In-memory buffer

#[derive(Default)]
struct InMemoryBuffer {
    queues: Mutex<HashMap<String, Vec<QueueItem>>>,
}

#[async_trait]
impl BufferCache for InMemoryBuffer {
    async fn append(
        &self,
        key: &str,
        payload: &QueuePayload,
        score: Option<i64>,
    ) -> Result<(), CacheError> {
        let mut queues = self.queues.lock();
        queues.entry(key.to_string()).or_default().push(QueueItem {
            id: Uuid::new_v4().to_string(),
            payload: payload.clone(),
            score: score.unwrap_or(0),
        });
        Ok(())
    }

    async fn restore(&self, key: &str, items: &[QueueItem]) -> Result<(), CacheError> {
        let mut queues = self.queues.lock();
        queues
            .entry(key.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<usize, CacheError> {
        Ok(self.queues.lock().get(key).map_or(0, Vec::len))
    }

    async fn clear(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.queues.lock().remove(key).is_some())
    }

    async fn trim_excess(&self, _key: &str) -> Result<u64, CacheError> {
        Ok(0)
    }

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
        let queues = self.queues.lock();
        let mut items: Vec<QueueItem> = queues
            .get(key)
            .map(|q| {
                q.iter()
                    .filter(|i| start.map_or(true, |s| i.score >= s))
                    .filter(|i| end.map_or(true, |e| i.score <= e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by_key(|i| i.score);
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn stats(&self, key: &str) -> Result<QueueStats, CacheError> {
        let items = self.range_ascending(key, None, None, None).await?;
        Ok(QueueStats {
            total_count: items.len(),
            max_length: 100,
            oldest_score: items.first().map(|i| i.score),
            newest_score: items.last().map(|i| i.score),
            ttl_seconds: 3600,
            is_full: items.len() >= 100,
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted LLM: routes by prompt kind

struct RoutingLlm {
    boundary_responses: Mutex<Vec<String>>,
    boundary_calls: AtomicUsize,
}

impl RoutingLlm {
    fn new(boundary_responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            boundary_responses: Mutex::new(
                boundary_responses.into_iter().map(String::from).collect(),
            ),
            boundary_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmBackend for RoutingLlm {
    async fn generate(&self, messages: &[Message]) -> Result<GenerationResult, LlmError> {
        let prompt = &messages[0].content;

        let text = if prompt.contains("segmenting a chat stream") {
            self.boundary_calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.boundary_responses.lock();
            if responses.is_empty() {
                r#"{"boundary": false, "cut_index": 0, "reason": "keep waiting"}"#.to_string()
            } else {
                responses.remove(0)
            }
        } else if prompt.contains("Summarize this closed conversation") {
            r#"{"subject": "Weekend plans", "summary": "The group settled on a Saturday hike.", "keywords": ["hike", "weekend"], "entities": ["Blue Ridge"]}"#
                .to_string()
        } else {
            r#"{"title": "A week of planning", "summary": "Plans came together.", "episode": "Over several chats the group planned the trip.", "search_phrases": ["trip planning"]}"#
                .to_string()
        };

        Ok(GenerationResult {
            text,
            completion_tokens: 0,
            total_time_ms: 1,
        })
    }

    fn model_name(&self) -> &str {
        "routing"
    }
}

// ---------------------------------------------------------------------------
// In-memory triple-store backends

#[derive(Default)]
struct MemRecords {
    records: Mutex<Vec<MemoryRecord>>,
    fail_insert: AtomicBool,
}

#[async_trait]
impl RecordStore for MemRecords {
    async fn insert(&self, record: &MemoryRecord) -> Result<(), StorageError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(StorageError::Database("insert refused".into()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<MemoryRecord>, StorageError> {
        Ok(self
            .records
            .lock()
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned())
    }

    async fn get_many(&self, event_ids: &[String]) -> Result<Vec<MemoryRecord>, StorageError> {
        let records = self.records.lock();
        Ok(event_ids
            .iter()
            .filter_map(|id| records.iter().find(|r| &r.event_id == id).cloned())
            .collect())
    }

    async fn delete_by_event_id(&self, event_id: &str) -> Result<bool, StorageError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.event_id != event_id);
        Ok(records.len() < before)
    }

    async fn delete_by_filters(&self, _: &DeleteFilter) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn fetch_page(
        &self,
        _: &str,
        _: Option<RecordType>,
        _: usize,
        _: usize,
        _: SortOrder,
    ) -> Result<FetchPage, StorageError> {
        Ok(FetchPage::default())
    }
}

#[derive(Default)]
struct NullText;

#[async_trait]
impl TextIndex for NullText {
    async fn index_record(&self, _: &MemoryRecord) -> Result<(), StorageError> {
        Ok(())
    }

    async fn search(&self, _: &TextSearchParams) -> Result<Vec<IndexHit>, StorageError> {
        Ok(Vec::new())
    }

    async fn delete_by_event_id(&self, _: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete_by_filters(&self, _: &DeleteFilter) -> Result<u64, StorageError> {
        Ok(0)
    }
}

#[derive(Default)]
struct NullVectors;

#[async_trait]
impl VectorIndex for NullVectors {
    async fn upsert(&self, _: &MemoryRecord, _: Vec<f32>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn search(
        &self,
        _: &[f32],
        _: usize,
        _: &IndexFilter,
    ) -> Result<Vec<IndexHit>, StorageError> {
        Ok(Vec::new())
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
        Ok(vec![0.0; 4])
    }

    fn dim(&self) -> usize {
        4
    }
}

// ---------------------------------------------------------------------------
// Fixture

struct Fixture {
    pipeline: MemorizePipeline,
    buffer: Arc<InMemoryBuffer>,
    records: Arc<MemRecords>,
    llm: Arc<RoutingLlm>,
}

fn fixture(boundary_responses: Vec<&str>, episode_batch_size: usize) -> Fixture {
    let buffer = Arc::new(InMemoryBuffer::default());
    let records = Arc::new(MemRecords::default());
    let llm = RoutingLlm::new(boundary_responses);

    let writer = Arc::new(TripleStoreWriter::new(
        records.clone(),
        Arc::new(NullText),
        Arc::new(NullVectors),
        Arc::new(ZeroEmbedder),
    ));

    let boundary_config = BoundaryConfig {
        max_retries: 0,
        retry_backoff_ms: 1,
        hard_cut_minutes: 30,
        hard_cut_count: 100,
    };

    let pipeline = MemorizePipeline::new(
        buffer.clone(),
        BoundaryDetector::new(llm.clone(), boundary_config),
        MemCellExtractor::new(llm.clone()),
        EpisodeExtractor::new(llm.clone()),
        writer,
        episode_batch_size,
    );

    Fixture {
        pipeline,
        buffer,
        records,
        llm,
    }
}

fn msg(id: &str, sender: &str, minute: i64) -> RawMessage {
    RawMessage {
        message_id: id.into(),
        group_id: "g1".into(),
        group_name: "Team".into(),
        sender_id: sender.into(),
        sender_name: None,
        content: format!("content {id}"),
        timestamp: FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .unwrap()
            + chrono::Duration::minutes(minute),
        refer_list: Vec::new(),
        scene: Scene::GroupChat,
    }
}

const BUFFER_KEY: &str = "memcell:buffer:g1";

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn accumulates_until_boundary_then_extracts() {
    // Boundary says "wait" at 3 and 4 messages, cuts the full buffer at 5
    let f = fixture(
        vec![
            r#"{"boundary": false, "cut_index": 0, "reason": "ongoing"}"#,
            r#"{"boundary": false, "cut_index": 0, "reason": "ongoing"}"#,
            r#"{"boundary": true, "cut_index": 5, "reason": "farewell"}"#,
        ],
        10,
    );

    let senders = ["alice", "bob", "alice", "carol", "alice"];
    let mut outcomes = Vec::new();
    for (i, sender) in senders.iter().enumerate() {
        let outcome = f
            .pipeline
            .process(&msg(&format!("m{i}"), sender, i as i64))
            .await
            .unwrap();
        outcomes.push(outcome);
    }

    // Four accumulations, then one extraction
    for outcome in &outcomes[..4] {
        assert_eq!(outcome, &ProcessOutcome::Accumulated);
    }
    let ProcessOutcome::Extracted { event_ids } = &outcomes[4] else {
        panic!("fifth message should extract");
    };
    assert_eq!(event_ids.len(), 1);

    // One MemCell carrying the verbatim segment
    let records = f.records.records.lock();
    assert_eq!(records.len(), 1);
    let cell = &records[0];
    assert_eq!(cell.original_data.len(), 5);
    assert_eq!(cell.timestamp, msg("m0", "alice", 0).timestamp);
    assert_eq!(cell.participants, vec!["alice", "bob", "carol"]);
    assert_eq!(cell.subject, "Weekend plans");
    assert_eq!(cell.group_id, "g1");
    assert!(!cell.is_episode());
    drop(records);

    // The emitted segment is gone from the buffer
    assert_eq!(f.buffer.size(BUFFER_KEY).await.unwrap(), 0);
    // Two messages were below the floor, three consulted the model
    assert_eq!(f.llm.boundary_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn silence_gap_cuts_without_consulting_the_model() {
    // The model would keep waiting forever; the 31-minute gap overrides it
    let f = fixture(
        vec![r#"{"boundary": false, "cut_index": 0, "reason": "ongoing"}"#],
        10,
    );

    for i in 0..3 {
        let outcome = f
            .pipeline
            .process(&msg(&format!("m{i}"), "alice", i))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Accumulated);
    }

    // 31 minutes after m2
    let outcome = f.pipeline.process(&msg("m3", "alice", 33)).await.unwrap();
    let ProcessOutcome::Extracted { event_ids } = outcome else {
        panic!("silence gap should force extraction");
    };
    assert_eq!(event_ids.len(), 1);

    // The first three messages form the cell; the fourth starts fresh
    let records = f.records.records.lock();
    assert_eq!(records[0].original_data.len(), 3);
    assert_eq!(records[0].timestamp, msg("m0", "alice", 0).timestamp);
    drop(records);
    assert_eq!(f.buffer.size(BUFFER_KEY).await.unwrap(), 1);

    // Only the pre-gap check reached the model
    assert_eq!(f.llm.boundary_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn write_failures_keep_segment_then_drop_it() {
    // Boundary always cuts the first three messages
    let f = fixture(
        vec![
            r#"{"boundary": true, "cut_index": 3, "reason": "done"}"#,
            r#"{"boundary": true, "cut_index": 3, "reason": "done"}"#,
            r#"{"boundary": true, "cut_index": 3, "reason": "done"}"#,
        ],
        10,
    );
    f.records.fail_insert.store(true, Ordering::SeqCst);

    // Two below-floor messages accumulate without touching the writer
    for i in 0..2 {
        f.pipeline
            .process(&msg(&format!("m{i}"), "alice", i))
            .await
            .unwrap();
    }

    // Three consecutive write failures; the segment survives the first two
    assert!(f.pipeline.process(&msg("m2", "alice", 2)).await.is_err());
    assert_eq!(f.buffer.size(BUFFER_KEY).await.unwrap(), 3);

    assert!(f.pipeline.process(&msg("m3", "alice", 3)).await.is_err());
    assert_eq!(f.buffer.size(BUFFER_KEY).await.unwrap(), 4);

    // Third failure drops the emitted prefix, the tail stays buffered
    assert!(f.pipeline.process(&msg("m4", "alice", 4)).await.is_err());
    assert_eq!(f.buffer.size(BUFFER_KEY).await.unwrap(), 2);
    assert!(f.records.records.lock().is_empty());
}

#[tokio::test]
async fn episode_derived_after_batch_of_memcells() {
    // Every third message closes a segment; batch size 2 folds the two
    // cells into an episode
    let f = fixture(
        vec![
            r#"{"boundary": true, "cut_index": 3, "reason": "done"}"#,
            r#"{"boundary": true, "cut_index": 3, "reason": "done"}"#,
        ],
        2,
    );

    let mut extracted = Vec::new();
    for i in 0..6 {
        let outcome = f
            .pipeline
            .process(&msg(&format!("m{i}"), "alice", i))
            .await
            .unwrap();
        if let ProcessOutcome::Extracted { event_ids } = outcome {
            extracted.push(event_ids);
        }
    }

    assert_eq!(extracted.len(), 2);
    // The second extraction also derived the episode
    assert_eq!(extracted[0].len(), 1);
    assert_eq!(extracted[1].len(), 2);

    let records = f.records.records.lock();
    assert_eq!(records.len(), 3);
    let episode = records.iter().find(|r| r.is_episode()).unwrap();
    assert_eq!(episode.record_type, RecordType::Episode);
    assert_eq!(episode.memcell_event_id_list.len(), 2);
    assert!(!episode.episode.is_empty());
}
