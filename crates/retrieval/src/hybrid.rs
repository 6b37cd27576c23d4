//! Hybrid retriever
//!
//! One read path over both indices. BM25 boosts each query term by its
//! smart text score; vector search embeds the query and runs cosine kNN;
//! RRF runs both sides in parallel and fuses by reciprocal rank. All modes
//! share the same scope, time-range, and validity-window filtering.

use async_trait::async_trait;
use chatmem_config::{constants::retrieval as limits, RetrievalConfig};
use chatmem_core::{
    MemoryScope, RetrievalMode, RetrievalResult, RetrievalResults, SmartTextScorer, TimeRange,
};
use chatmem_llm::Embedder;
use chatmem_storage::{IndexFilter, IndexHit, TextIndex, TextSearchParams, VectorIndex};
use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;
use std::sync::Arc;

use crate::RetrievalError;

/// One search request
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// May be empty: the text side then degrades to a newest-first listing
    pub query: String,
    pub user_id: String,
    pub group_id: Option<String>,
    pub scope: MemoryScope,
    pub mode: RetrievalMode,
    pub top_k: usize,
    pub time_range: Option<TimeRange>,
    /// Reference instant for the validity-window filter
    pub current_time: Option<DateTime<FixedOffset>>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            group_id: None,
            scope: MemoryScope::All,
            mode: RetrievalMode::Rrf,
            top_k: limits::DEFAULT_TOP_K,
            time_range: None,
            current_time: None,
        }
    }
}

/// Read-path contract; the agentic layer talks to this
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<RetrievalResults, RetrievalError>;
}

/// Hybrid retriever over the text and vector indices
pub struct HybridRetriever {
    text: Arc<dyn TextIndex>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    scorer: SmartTextScorer,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        text: Arc<dyn TextIndex>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            text,
            vectors,
            embedder,
            scorer: SmartTextScorer::default(),
            config,
        }
    }

    /// Split a query into weighted terms, best smart score first, capped at
    /// the configured term budget
    fn query_terms(&self, query: &str) -> Vec<(String, f32)> {
        let mut terms: Vec<(String, f32)> = query
            .split_whitespace()
            .filter(|w| !w.is_empty())
            .map(|w| (w.to_string(), self.scorer.score(w)))
            .collect();
        terms.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        terms.truncate(limits::MAX_QUERY_TERMS);
        terms
    }

    /// Map the request scope and time range onto an index filter
    fn build_filter(&self, request: &SearchRequest) -> Result<IndexFilter, RetrievalError> {
        let mut filter = IndexFilter::default();

        match request.scope {
            MemoryScope::Personal => {
                filter.user_id = Some(request.user_id.clone());
            }
            MemoryScope::Group => {
                let group_id = request
                    .group_id
                    .clone()
                    .filter(|g| !g.is_empty())
                    .ok_or_else(|| {
                        RetrievalError::InvalidRequest(
                            "group scope requires a group_id".into(),
                        )
                    })?;
                filter.group_id = Some(group_id);
            }
            MemoryScope::All => {
                filter.user_id = Some(request.user_id.clone());
                if let Some(group_id) = request.group_id.clone().filter(|g| !g.is_empty()) {
                    filter.group_id = Some(group_id);
                    filter.any_scope = true;
                }
            }
        }

        if let Some(range) = &request.time_range {
            filter.start_ms = range.start.map(|t| t.timestamp_millis());
            filter.end_ms = range.end.map(|t| t.timestamp_millis());
        }

        Ok(filter)
    }

    async fn search_bm25(
        &self,
        request: &SearchRequest,
        limit: usize,
    ) -> Result<Vec<IndexHit>, RetrievalError> {
        let params = TextSearchParams {
            terms: self.query_terms(&request.query),
            filter: self.build_filter(request)?,
            limit,
            offset: 0,
        };
        Ok(self.text.search(&params).await?)
    }

    async fn search_embedding(
        &self,
        request: &SearchRequest,
        limit: usize,
    ) -> Result<Vec<IndexHit>, RetrievalError> {
        let embedding = self.embedder.embed(&request.query).await?;
        let filter = self.build_filter(request)?;
        Ok(self.vectors.search(&embedding, limit, &filter).await?)
    }

    /// Exclude hits whose validity window does not contain `current_time`.
    /// Records missing either bound always pass.
    fn apply_validity_filter(
        &self,
        hits: &mut Vec<IndexHit>,
        current_time: Option<DateTime<FixedOffset>>,
    ) {
        if !self.config.validity_filter_enabled {
            return;
        }
        let Some(now) = current_time else {
            return;
        };
        let now_ms = now.timestamp_millis();
        hits.retain(|h| match (h.start_ms, h.end_ms) {
            (Some(start), Some(end)) => (start..=end).contains(&now_ms),
            _ => true,
        });
    }

    fn to_results(hits: Vec<IndexHit>) -> Vec<RetrievalResult> {
        hits.into_iter()
            .map(|h| RetrievalResult {
                timestamp: h.timestamp(),
                event_id: h.event_id,
                score: h.score,
                subject: h.subject,
                summary: h.summary,
                episode: h.episode,
            })
            .collect()
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn search(&self, request: &SearchRequest) -> Result<RetrievalResults, RetrievalError> {
        let started = std::time::Instant::now();
        let top_k = request.top_k.max(1);

        // An empty query cannot rank; serve a newest-first listing whatever
        // the requested mode
        let effective_mode = if request.query.trim().is_empty() {
            RetrievalMode::Bm25
        } else {
            request.mode
        };

        let mut response = RetrievalResults::default();

        let mut hits = match effective_mode {
            RetrievalMode::Bm25 => self.search_bm25(request, top_k).await?,
            RetrievalMode::Embedding => self.search_embedding(request, top_k).await?,
            RetrievalMode::Rrf => {
                // candidates_per_side = max(configured floor, top_k * 5)
                let per_side = self.config.candidates_per_side.max(top_k * 5);

                let (bm25, vector) = tokio::join!(
                    self.search_bm25(request, per_side),
                    self.search_embedding(request, per_side)
                );
                let bm25 = bm25?;
                let vector = vector?;

                response.set_meta("bm25_count", serde_json::json!(bm25.len()));
                response.set_meta("vector_count", serde_json::json!(vector.len()));

                self.fuse(bm25, vector)
            }
        };

        self.apply_validity_filter(&mut hits, request.current_time);
        hits.truncate(top_k);

        response.results = Self::to_results(hits);
        response.set_meta(
            "retrieval_mode",
            serde_json::json!(effective_mode.as_str()),
        );
        response.set_meta(
            "total_latency_ms",
            serde_json::json!(started.elapsed().as_millis() as u64),
        );
        if response.results.is_empty() {
            response.set_meta(
                "reasoning",
                serde_json::json!("no records matched the query and filters"),
            );
        }

        tracing::debug!(
            mode = effective_mode.as_str(),
            results = response.results.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "search completed"
        );
        Ok(response)
    }
}

impl HybridRetriever {
    /// RRF fusion over both ranked lists
    pub fn fuse(&self, bm25: Vec<IndexHit>, vector: Vec<IndexHit>) -> Vec<IndexHit> {
        let k = self.config.rrf_k;
        let mut scores: HashMap<String, f32> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut hits: HashMap<String, IndexHit> = HashMap::new();

        for side in [bm25, vector] {
            for (rank, hit) in side.into_iter().enumerate() {
                let contribution = 1.0 / (k + (rank + 1) as f32);
                let entry = scores.entry(hit.event_id.clone()).or_insert(0.0);
                *entry += contribution;
                if !hits.contains_key(&hit.event_id) {
                    order.push(hit.event_id.clone());
                    hits.insert(hit.event_id.clone(), hit);
                }
            }
        }

        let mut fused: Vec<IndexHit> = order
            .into_iter()
            .filter_map(|id| {
                hits.remove(&id).map(|mut hit| {
                    hit.score = scores.get(&hit.event_id).copied().unwrap_or(0.0);
                    hit
                })
            })
            .collect();

        // Stable sort keeps insertion order for equal fused scores
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        fused
    }
}
