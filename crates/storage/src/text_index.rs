//! Text index using Tantivy (BM25)
//!
//! Keyword side of the triple store. `search_content` is indexed under a
//! registered multilingual tokenizer; queries arrive as pre-weighted terms
//! (smart text score as boost) and at least one term must match. Scope
//! filters are term queries; time-range constraints are applied to the
//! stored timestamp after collection, with over-fetch to compensate.

use crate::{DeleteFilter, IndexFilter, IndexHit, StorageError};
use async_trait::async_trait;
use chatmem_core::MemoryRecord;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tantivy::{
    collector::TopDocs,
    query::{AllQuery, BooleanQuery, BoostQuery, Occur, Query, TermQuery},
    schema::{Field, IndexRecordOption, OwnedValue, Schema, TextFieldIndexing, TextOptions, FAST, INDEXED, STORED, STRING},
    tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer},
    Index, IndexReader, IndexWriter, Order, TantivyDocument, Term,
};

/// A keyword search request
#[derive(Debug, Clone, Default)]
pub struct TextSearchParams {
    /// Query terms with their boosts; empty means pure filter listing,
    /// newest first
    pub terms: Vec<(String, f32)>,
    pub filter: IndexFilter,
    pub limit: usize,
    pub offset: usize,
}

/// Text index contract
#[async_trait]
pub trait TextIndex: Send + Sync {
    async fn index_record(&self, record: &MemoryRecord) -> Result<(), StorageError>;

    async fn search(&self, params: &TextSearchParams) -> Result<Vec<IndexHit>, StorageError>;

    async fn delete_by_event_id(&self, event_id: &str) -> Result<(), StorageError>;

    async fn delete_by_filters(&self, filter: &DeleteFilter) -> Result<u64, StorageError>;
}

#[derive(Clone, Copy)]
struct Fields {
    event_id: Field,
    user_id: Field,
    group_id: Field,
    participants: Field,
    record_type: Field,
    subject: Field,
    summary: Field,
    episode: Field,
    search_content: Field,
    timestamp_ms: Field,
    tz_offset_secs: Field,
    start_ms: Field,
    end_ms: Field,
}

/// Tantivy-backed text index
#[derive(Clone)]
pub struct TantivyTextIndex {
    #[allow(dead_code)] // kept alive so the mmap directory outlives reader and writer
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
    analyzer: TextAnalyzer,
    fields: Fields,
}

impl TantivyTextIndex {
    /// Open (or create) an on-disk index
    pub fn open(path: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)
            .map_err(|e| StorageError::Index(format!("failed to create index dir: {e}")))?;
        let dir = tantivy::directory::MmapDirectory::open(Path::new(path))
            .map_err(|e| StorageError::Index(e.to_string()))?;
        Self::build(|schema| {
            Index::open_or_create(dir, schema).map_err(|e| StorageError::Index(e.to_string()))
        })
    }

    /// In-RAM index for tests and development
    pub fn in_ram() -> Result<Self, StorageError> {
        Self::build(|schema| Ok(Index::create_in_ram(schema)))
    }

    fn build(
        make_index: impl FnOnce(Schema) -> Result<Index, StorageError>,
    ) -> Result<Self, StorageError> {
        let mut schema_builder = Schema::builder();

        let text_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer("multilingual")
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();

        let fields = Fields {
            event_id: schema_builder.add_text_field("event_id", STRING | STORED),
            user_id: schema_builder.add_text_field("user_id", STRING | STORED),
            group_id: schema_builder.add_text_field("group_id", STRING | STORED),
            participants: schema_builder.add_text_field("participants", STRING),
            record_type: schema_builder.add_text_field("record_type", STRING | STORED),
            subject: schema_builder.add_text_field("subject", STORED),
            summary: schema_builder.add_text_field("summary", STORED),
            episode: schema_builder.add_text_field("episode", STORED),
            search_content: schema_builder.add_text_field("search_content", text_options),
            timestamp_ms: schema_builder.add_i64_field("timestamp_ms", INDEXED | STORED | FAST),
            tz_offset_secs: schema_builder.add_i64_field("tz_offset_secs", STORED),
            start_ms: schema_builder.add_i64_field("start_ms", STORED),
            end_ms: schema_builder.add_i64_field("end_ms", STORED),
        };

        let schema = schema_builder.build();
        let index = make_index(schema)?;

        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(100))
            .filter(LowerCaser)
            .build();
        index.tokenizers().register("multilingual", analyzer.clone());

        let reader = index
            .reader()
            .map_err(|e| StorageError::Index(e.to_string()))?;
        let writer = index
            .writer(50_000_000)
            .map_err(|e| StorageError::Index(e.to_string()))?;

        Ok(Self {
            index,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            analyzer,
            fields,
        })
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    fn commit_and_reload(&self) -> Result<(), StorageError> {
        self.writer
            .lock()
            .commit()
            .map_err(|e| StorageError::Index(e.to_string()))?;
        self.reader
            .reload()
            .map_err(|e| StorageError::Index(e.to_string()))?;
        Ok(())
    }

    /// Analyze a query term into a match query over `search_content`
    fn match_query(&self, term: &str) -> Option<Box<dyn Query>> {
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(term);
        let mut tokens: Vec<Term> = Vec::new();
        while let Some(token) = stream.next() {
            tokens.push(Term::from_field_text(self.fields.search_content, &token.text));
        }

        match tokens.len() {
            0 => None,
            1 => Some(Box::new(TermQuery::new(
                tokens.into_iter().next().expect("one token"),
                IndexRecordOption::WithFreqs,
            ))),
            _ => {
                let subqueries: Vec<(Occur, Box<dyn Query>)> = tokens
                    .into_iter()
                    .map(|t| {
                        (
                            Occur::Should,
                            Box::new(TermQuery::new(t, IndexRecordOption::WithFreqs))
                                as Box<dyn Query>,
                        )
                    })
                    .collect();
                Some(Box::new(BooleanQuery::new(subqueries)))
            }
        }
    }

    fn filter_clauses(&self, filter: &IndexFilter) -> Vec<(Occur, Box<dyn Query>)> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        let user_clause = filter.user_id.as_ref().map(|user_id| {
            Box::new(TermQuery::new(
                Term::from_field_text(self.fields.user_id, user_id),
                IndexRecordOption::Basic,
            )) as Box<dyn Query>
        });
        let group_clause = filter.group_id.as_ref().filter(|g| !g.is_empty()).map(|group_id| {
            Box::new(TermQuery::new(
                Term::from_field_text(self.fields.group_id, group_id),
                IndexRecordOption::Basic,
            )) as Box<dyn Query>
        });

        match (user_clause, group_clause, filter.any_scope) {
            (Some(u), Some(g), true) => {
                clauses.push((
                    Occur::Must,
                    Box::new(BooleanQuery::new(vec![
                        (Occur::Should, u),
                        (Occur::Should, g),
                    ])),
                ));
            }
            (u, g, _) => {
                if let Some(u) = u {
                    clauses.push((Occur::Must, u));
                }
                if let Some(g) = g {
                    clauses.push((Occur::Must, g));
                }
            }
        }

        if let Some(kind) = filter.record_type {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.fields.record_type, kind.as_str()),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        clauses
    }

    fn build_query(&self, params: &TextSearchParams) -> Box<dyn Query> {
        let mut clauses = self.filter_clauses(&params.filter);

        let term_clauses: Vec<(Occur, Box<dyn Query>)> = params
            .terms
            .iter()
            .filter_map(|(term, boost)| {
                self.match_query(term)
                    .map(|q| (Occur::Should, Box::new(BoostQuery::new(q, *boost)) as Box<dyn Query>))
            })
            .collect();

        if !term_clauses.is_empty() {
            // Nesting keeps should semantics: at least one term must match
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(term_clauses))));
        }

        if clauses.is_empty() {
            Box::new(AllQuery)
        } else {
            Box::new(BooleanQuery::new(clauses))
        }
    }

    fn doc_to_hit(&self, doc: &TantivyDocument, score: f32) -> IndexHit {
        let text = |field: Field| -> String {
            doc.get_first(field)
                .and_then(|v| match v {
                    OwnedValue::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .unwrap_or_default()
        };
        let int = |field: Field| -> Option<i64> {
            doc.get_first(field).and_then(|v| match v {
                OwnedValue::I64(i) => Some(*i),
                _ => None,
            })
        };

        IndexHit {
            event_id: text(self.fields.event_id),
            score,
            subject: text(self.fields.subject),
            summary: text(self.fields.summary),
            episode: text(self.fields.episode),
            timestamp_ms: int(self.fields.timestamp_ms).unwrap_or(0),
            tz_offset_secs: int(self.fields.tz_offset_secs).unwrap_or(0) as i32,
            start_ms: int(self.fields.start_ms),
            end_ms: int(self.fields.end_ms),
        }
    }

    fn search_blocking(&self, params: &TextSearchParams) -> Result<Vec<IndexHit>, StorageError> {
        let searcher = self.reader.searcher();
        let query = self.build_query(params);

        // Time-range constraints filter on the stored timestamp after
        // collection, so over-fetch when one is present.
        let has_time_filter = params.filter.start_ms.is_some() || params.filter.end_ms.is_some();
        let wanted = params.limit + params.offset;
        let fetch = if has_time_filter {
            wanted * 4 + 64
        } else {
            wanted
        };

        let mut hits: Vec<IndexHit> = if params.terms.is_empty() {
            // Pure filter listing: newest first by the timestamp fast field
            let docs = searcher
                .search(
                    &query,
                    &TopDocs::with_limit(fetch.max(1))
                        .order_by_fast_field::<i64>("timestamp_ms", Order::Desc),
                )
                .map_err(|e| StorageError::Search(e.to_string()))?;
            let mut out = Vec::with_capacity(docs.len());
            for (_ts, addr) in docs {
                let doc: TantivyDocument = searcher
                    .doc(addr)
                    .map_err(|e| StorageError::Search(e.to_string()))?;
                out.push(self.doc_to_hit(&doc, 0.0));
            }
            out
        } else {
            let docs = searcher
                .search(&query, &TopDocs::with_limit(fetch.max(1)))
                .map_err(|e| StorageError::Search(e.to_string()))?;
            let mut out = Vec::with_capacity(docs.len());
            for (score, addr) in docs {
                let doc: TantivyDocument = searcher
                    .doc(addr)
                    .map_err(|e| StorageError::Search(e.to_string()))?;
                out.push(self.doc_to_hit(&doc, score));
            }
            out
        };

        if has_time_filter {
            hits.retain(|h| {
                params.filter.start_ms.map_or(true, |s| h.timestamp_ms >= s)
                    && params.filter.end_ms.map_or(true, |e| h.timestamp_ms <= e)
            });
        }

        Ok(hits
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .collect())
    }
}

#[async_trait]
impl TextIndex for TantivyTextIndex {
    async fn index_record(&self, record: &MemoryRecord) -> Result<(), StorageError> {
        let mut doc = TantivyDocument::default();
        doc.add_text(self.fields.event_id, &record.event_id);
        doc.add_text(self.fields.user_id, &record.user_id);
        doc.add_text(self.fields.group_id, &record.group_id);
        for participant in &record.participants {
            doc.add_text(self.fields.participants, participant);
        }
        doc.add_text(self.fields.record_type, record.record_type.as_str());
        doc.add_text(self.fields.subject, &record.subject);
        doc.add_text(self.fields.summary, &record.summary);
        doc.add_text(self.fields.episode, &record.episode);
        for content in record.search_content() {
            doc.add_text(self.fields.search_content, &content);
        }
        doc.add_i64(self.fields.timestamp_ms, record.timestamp.timestamp_millis());
        doc.add_i64(
            self.fields.tz_offset_secs,
            record.timestamp.offset().local_minus_utc() as i64,
        );
        if let Some(start) = record.start_time {
            doc.add_i64(self.fields.start_ms, start.timestamp_millis());
        }
        if let Some(end) = record.end_time {
            doc.add_i64(self.fields.end_ms, end.timestamp_millis());
        }

        self.writer
            .lock()
            .add_document(doc)
            .map_err(|e| StorageError::Index(e.to_string()))?;
        self.commit_and_reload()?;

        tracing::debug!(event_id = %record.event_id, "record indexed for keyword search");
        Ok(())
    }

    async fn search(&self, params: &TextSearchParams) -> Result<Vec<IndexHit>, StorageError> {
        // Tantivy search is CPU-bound; keep it off the async executor
        let this = self.clone();
        let params = params.clone();
        tokio::task::spawn_blocking(move || this.search_blocking(&params))
            .await
            .map_err(|e| StorageError::Search(format!("search task failed: {e}")))?
    }

    async fn delete_by_event_id(&self, event_id: &str) -> Result<(), StorageError> {
        let term = Term::from_field_text(self.fields.event_id, event_id);
        self.writer.lock().delete_term(term);
        self.commit_and_reload()
    }

    async fn delete_by_filters(&self, filter: &DeleteFilter) -> Result<u64, StorageError> {
        filter.validate()?;

        let params = TextSearchParams {
            terms: Vec::new(),
            filter: IndexFilter {
                user_id: filter.user_id.clone(),
                group_id: filter.group_id.clone(),
                any_scope: filter.user_id.is_some() && filter.group_id.is_some(),
                record_type: None,
                start_ms: filter.start_ms,
                end_ms: filter.end_ms,
            },
            limit: 10_000,
            offset: 0,
        };
        let hits = self.search(&params).await?;
        let count = hits.len() as u64;

        {
            let writer = self.writer.lock();
            for hit in &hits {
                writer.delete_term(Term::from_field_text(self.fields.event_id, &hit.event_id));
            }
        }
        self.commit_and_reload()?;

        tracing::info!(deleted = count, "text index entries deleted by filter");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmem_core::RecordType;
    use chrono::{FixedOffset, TimeZone, Utc};

    fn record(event_id: &str, user_id: &str, group_id: &str, subject: &str, hour: u32) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            event_id: event_id.into(),
            user_id: user_id.into(),
            group_id: group_id.into(),
            participants: vec!["alice".into()],
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 6, 1, hour, 0, 0)
                .unwrap(),
            record_type: RecordType::Conversation,
            subject: subject.into(),
            summary: format!("summary about {subject}"),
            keywords: vec!["memo".into()],
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

    fn terms(words: &[&str]) -> Vec<(String, f32)> {
        words.iter().map(|w| (w.to_string(), 1.0)).collect()
    }

    #[tokio::test]
    async fn test_index_and_keyword_search() {
        let index = TantivyTextIndex::in_ram().unwrap();
        index
            .index_record(&record("e1", "u1", "", "coffee brewing tips", 9))
            .await
            .unwrap();
        index
            .index_record(&record("e2", "u1", "", "travel plans for rome", 10))
            .await
            .unwrap();

        let hits = index
            .search(&TextSearchParams {
                terms: terms(&["coffee"]),
                filter: IndexFilter::default(),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].event_id, "e1");
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_term_boost_orders_results() {
        let index = TantivyTextIndex::in_ram().unwrap();
        index
            .index_record(&record("e1", "u1", "", "coffee", 9))
            .await
            .unwrap();
        index
            .index_record(&record("e2", "u1", "", "travel", 10))
            .await
            .unwrap();

        let hits = index
            .search(&TextSearchParams {
                terms: vec![("coffee".into(), 0.1), ("travel".into(), 9.0)],
                filter: IndexFilter::default(),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].event_id, "e2");
    }

    #[tokio::test]
    async fn test_scope_union_filter() {
        let index = TantivyTextIndex::in_ram().unwrap();
        index
            .index_record(&record("personal", "u1", "", "coffee", 9))
            .await
            .unwrap();
        index
            .index_record(&record("grouped", "", "g1", "coffee", 10))
            .await
            .unwrap();
        index
            .index_record(&record("foreign", "u2", "g2", "coffee", 11))
            .await
            .unwrap();

        let hits = index
            .search(&TextSearchParams {
                terms: terms(&["coffee"]),
                filter: IndexFilter {
                    user_id: Some("u1".into()),
                    group_id: Some("g1".into()),
                    any_scope: true,
                    ..IndexFilter::default()
                },
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.event_id.as_str()).collect();
        assert!(ids.contains(&"personal"));
        assert!(ids.contains(&"grouped"));
        assert!(!ids.contains(&"foreign"));
    }

    #[tokio::test]
    async fn test_empty_query_lists_newest_first() {
        let index = TantivyTextIndex::in_ram().unwrap();
        index
            .index_record(&record("old", "u1", "", "alpha", 8))
            .await
            .unwrap();
        index
            .index_record(&record("new", "u1", "", "beta", 12))
            .await
            .unwrap();

        let hits = index
            .search(&TextSearchParams {
                terms: Vec::new(),
                filter: IndexFilter {
                    user_id: Some("u1".into()),
                    ..IndexFilter::default()
                },
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].event_id, "new");
        assert_eq!(hits[1].event_id, "old");
    }

    #[tokio::test]
    async fn test_time_range_filters_hits() {
        let index = TantivyTextIndex::in_ram().unwrap();
        index
            .index_record(&record("morning", "u1", "", "coffee", 8))
            .await
            .unwrap();
        index
            .index_record(&record("evening", "u1", "", "coffee", 20))
            .await
            .unwrap();

        let noon = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .unwrap()
            .timestamp_millis();

        let hits = index
            .search(&TextSearchParams {
                terms: terms(&["coffee"]),
                filter: IndexFilter {
                    start_ms: Some(noon),
                    ..IndexFilter::default()
                },
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].event_id, "evening");
    }

    #[tokio::test]
    async fn test_on_disk_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();

        {
            let index = TantivyTextIndex::open(&path).unwrap();
            index
                .index_record(&record("e1", "u1", "", "coffee", 9))
                .await
                .unwrap();
        }

        let reopened = TantivyTextIndex::open(&path).unwrap();
        assert_eq!(reopened.doc_count(), 1);
        let hits = reopened
            .search(&TextSearchParams {
                terms: terms(&["coffee"]),
                filter: IndexFilter::default(),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_event_id() {
        let index = TantivyTextIndex::in_ram().unwrap();
        index
            .index_record(&record("e1", "u1", "", "coffee", 9))
            .await
            .unwrap();
        assert_eq!(index.doc_count(), 1);

        index.delete_by_event_id("e1").await.unwrap();
        assert_eq!(index.doc_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_by_filters_scopes_to_owner() {
        let index = TantivyTextIndex::in_ram().unwrap();
        index
            .index_record(&record("mine", "u1", "", "coffee", 9))
            .await
            .unwrap();
        index
            .index_record(&record("theirs", "u2", "", "coffee", 9))
            .await
            .unwrap();

        let deleted = index
            .delete_by_filters(&DeleteFilter {
                user_id: Some("u1".into()),
                ..DeleteFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(index.doc_count(), 1);
    }
}
