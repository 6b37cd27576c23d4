//! Agentic retrieval
//!
//! Two-round flow: an RRF first pass, an LLM judgment of whether those
//! results answer the query, and — when they don't — parallel re-retrieval
//! with the judge's refined queries, merged by max score. Every stage has
//! its own budget and the whole flow has an overall one.

use chatmem_config::AgenticConfig;
use chatmem_core::{MemoryScope, RetrievalMode, RetrievalResult, RetrievalResults, TimeRange};
use chatmem_llm::{extract_json_object, LlmBackend, Message};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::hybrid::{Retriever, SearchRequest};
use crate::RetrievalError;

/// An agentic search request
#[derive(Debug, Clone)]
pub struct AgenticRequest {
    pub query: String,
    pub user_id: String,
    pub group_id: Option<String>,
    pub top_k: usize,
    /// Restrict to the last N days before `current_time`
    pub time_range_days: Option<i64>,
    pub current_time: Option<DateTime<FixedOffset>>,
}

/// The judge's strict-JSON verdict
#[derive(Debug, Deserialize)]
struct JudgeResponse {
    is_sufficient: bool,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    refined_queries: Vec<String>,
}

/// LLM-judged two-round retriever over the hybrid engine
pub struct AgenticRetriever {
    retriever: Arc<dyn Retriever>,
    llm: Arc<dyn LlmBackend>,
    config: AgenticConfig,
}

impl AgenticRetriever {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        llm: Arc<dyn LlmBackend>,
        config: AgenticConfig,
    ) -> Self {
        Self {
            retriever,
            llm,
            config,
        }
    }

    /// Run the agentic flow under the overall budget
    pub async fn search(
        &self,
        request: &AgenticRequest,
    ) -> Result<RetrievalResults, RetrievalError> {
        let overall = Duration::from_secs(self.config.overall_timeout_s);
        match tokio::time::timeout(overall, self.search_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(RetrievalError::Timeout(format!(
                "agentic retrieval exceeded {}s budget",
                self.config.overall_timeout_s
            ))),
        }
    }

    async fn search_inner(
        &self,
        request: &AgenticRequest,
    ) -> Result<RetrievalResults, RetrievalError> {
        let started = std::time::Instant::now();
        let top_k = request.top_k.max(1);
        let round1_k = self.config.round1_k.unwrap_or(top_k);

        // Round 1: fused retrieval
        let base_request = self.base_request(request, round1_k);
        let round1 = tokio::time::timeout(
            Duration::from_secs(self.config.round1_timeout_s),
            self.retriever.search(&base_request),
        )
        .await
        .map_err(|_| RetrievalError::Timeout("agentic round 1 timed out".into()))??;

        // Judge: can these results answer the query?
        let verdict = match self.judge(&request.query, &round1.results).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(error = %e, "agentic judge failed, returning round-1 results");
                let mut fallback = round1;
                fallback.set_meta("retrieval_mode", serde_json::json!("agentic_fallback"));
                fallback.set_meta(
                    "total_latency_ms",
                    serde_json::json!(started.elapsed().as_millis() as u64),
                );
                return Ok(fallback);
            }
        };

        if verdict.is_sufficient || verdict.refined_queries.is_empty() {
            let mut response = round1;
            response.set_meta("retrieval_mode", serde_json::json!("agentic"));
            response.set_meta("is_sufficient", serde_json::json!(true));
            response.set_meta("is_multi_round", serde_json::json!(false));
            response.set_meta("reasoning", serde_json::json!(verdict.reasoning));
            response.set_meta(
                "total_latency_ms",
                serde_json::json!(started.elapsed().as_millis() as u64),
            );
            return Ok(response);
        }

        // Round 2: refined queries in parallel, bounded fan-out
        let refined_queries = verdict.refined_queries.clone();
        let round2_results = self
            .run_refined(request, &refined_queries, top_k)
            .await;
        let round2_count: usize = round2_results.iter().map(|r| r.results.len()).sum();

        let round1_count = round1.results.len();
        let merged = merge_by_max_score(
            std::iter::once(round1.results)
                .chain(round2_results.into_iter().map(|r| r.results)),
            top_k,
        );

        let mut response = RetrievalResults {
            results: merged,
            metadata: HashMap::new(),
        };
        response.set_meta("retrieval_mode", serde_json::json!("agentic"));
        response.set_meta("is_sufficient", serde_json::json!(false));
        response.set_meta("is_multi_round", serde_json::json!(true));
        response.set_meta("round1_count", serde_json::json!(round1_count));
        response.set_meta("round2_count", serde_json::json!(round2_count));
        response.set_meta("refined_queries", serde_json::json!(refined_queries));
        response.set_meta("reasoning", serde_json::json!(verdict.reasoning));
        response.set_meta(
            "total_latency_ms",
            serde_json::json!(started.elapsed().as_millis() as u64),
        );
        if response.results.is_empty() {
            response.set_meta(
                "reasoning",
                serde_json::json!("no records matched after refinement"),
            );
        }

        tracing::info!(
            round1 = round1_count,
            round2 = round2_count,
            refined = refined_queries.len(),
            "agentic retrieval completed in two rounds"
        );
        Ok(response)
    }

    fn base_request(&self, request: &AgenticRequest, top_k: usize) -> SearchRequest {
        let time_range = request.time_range_days.map(|days| {
            let end = request.current_time;
            let start = end
                .map(|t| t - ChronoDuration::days(days))
                .or_else(|| {
                    // Without a reference instant, anchor on the present
                    let now: DateTime<FixedOffset> = chrono::Utc::now().fixed_offset();
                    Some(now - ChronoDuration::days(days))
                });
            TimeRange { start, end }
        });

        SearchRequest {
            query: request.query.clone(),
            user_id: request.user_id.clone(),
            group_id: request.group_id.clone(),
            scope: MemoryScope::All,
            mode: RetrievalMode::Rrf,
            top_k,
            time_range,
            current_time: request.current_time,
        }
    }

    async fn judge(
        &self,
        query: &str,
        results: &[RetrievalResult],
    ) -> Result<JudgeResponse, RetrievalError> {
        let prompt = judge_prompt(query, results);
        let generation = tokio::time::timeout(
            Duration::from_secs(self.config.llm_judge_timeout_s),
            self.llm.generate(&[Message::user(prompt)]),
        )
        .await
        .map_err(|_| RetrievalError::Timeout("agentic judge timed out".into()))??;

        let json = extract_json_object(&generation.text).ok_or_else(|| {
            RetrievalError::InvalidRequest("judge returned no json object".into())
        })?;
        serde_json::from_str(json)
            .map_err(|e| RetrievalError::InvalidRequest(format!("judge response invalid: {e}")))
    }

    /// Run every refined query under the round-2 budget, at most
    /// `max_parallel_refined` concurrently; failures are logged and skipped
    async fn run_refined(
        &self,
        request: &AgenticRequest,
        refined: &[String],
        top_k: usize,
    ) -> Vec<RetrievalResults> {
        let gather = stream::iter(refined.iter().cloned())
            .map(|refined_query| {
                let search = SearchRequest {
                    query: refined_query.clone(),
                    ..self.base_request(request, top_k)
                };
                async move {
                    match self.retriever.search(&search).await {
                        Ok(results) => Some(results),
                        Err(e) => {
                            tracing::warn!(query = %refined_query, error = %e, "refined query failed");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_parallel_refined.max(1))
            .collect::<Vec<Option<RetrievalResults>>>();

        match tokio::time::timeout(Duration::from_secs(self.config.round2_timeout_s), gather)
            .await
        {
            Ok(results) => results.into_iter().flatten().collect(),
            Err(_) => {
                tracing::warn!("agentic round 2 timed out, merging round-1 results only");
                Vec::new()
            }
        }
    }
}

/// Merge ranked lists by max score per event id, descending, truncated
fn merge_by_max_score(
    sides: impl IntoIterator<Item = Vec<RetrievalResult>>,
    top_k: usize,
) -> Vec<RetrievalResult> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, RetrievalResult> = HashMap::new();

    for side in sides {
        for result in side {
            match best.get_mut(&result.event_id) {
                Some(existing) => {
                    if result.score > existing.score {
                        *existing = result;
                    }
                }
                None => {
                    order.push(result.event_id.clone());
                    best.insert(result.event_id.clone(), result);
                }
            }
        }
    }

    let mut merged: Vec<RetrievalResult> = order
        .into_iter()
        .filter_map(|id| best.remove(&id))
        .collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);
    merged
}

fn judge_prompt(query: &str, results: &[RetrievalResult]) -> String {
    let snippets = if results.is_empty() {
        "(no results)".to_string()
    } else {
        results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {} — {}", i + 1, r.subject, r.summary))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are judging whether retrieved memories answer a user query.

Query: "{query}"

Retrieved memories:
{snippets}

If the memories already cover the query, they are sufficient. If they miss
aspects of it, propose up to 3 refined search queries that would surface
the missing information; each must stand on its own.

Respond with JSON only:
{{
    "is_sufficient": true/false,
    "reasoning": "<one or two sentences>",
    "refined_queries": ["<query>", ...]
}}"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatmem_llm::{GenerationResult, LlmError};
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn result(event_id: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            event_id: event_id.into(),
            score,
            subject: format!("subject {event_id}"),
            summary: "short".into(),
            episode: String::new(),
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
                .unwrap(),
        }
    }

    /// Fake engine: first call returns round-1 results, later calls are
    /// keyed by the refined query text
    struct FakeEngine {
        round1: Vec<RetrievalResult>,
        by_query: HashMap<String, Vec<RetrievalResult>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Retriever for FakeEngine {
        async fn search(
            &self,
            request: &SearchRequest,
        ) -> Result<RetrievalResults, RetrievalError> {
            self.calls.lock().push(request.query.clone());
            let results = self
                .by_query
                .get(&request.query)
                .cloned()
                .unwrap_or_else(|| self.round1.clone());
            Ok(RetrievalResults {
                results,
                metadata: HashMap::new(),
            })
        }
    }

    struct ScriptedLlm(Result<String, ()>);

    #[async_trait]
    impl LlmBackend for ScriptedLlm {
        async fn generate(&self, _: &[Message]) -> Result<GenerationResult, LlmError> {
            match &self.0 {
                Ok(text) => Ok(GenerationResult {
                    text: text.clone(),
                    completion_tokens: 0,
                    total_time_ms: 1,
                }),
                Err(()) => Err(LlmError::Network("judge unavailable".into())),
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn request() -> AgenticRequest {
        AgenticRequest {
            query: "what does the user drink".into(),
            user_id: "u1".into(),
            group_id: None,
            top_k: 10,
            time_range_days: None,
            current_time: None,
        }
    }

    #[tokio::test]
    async fn test_sufficient_round1_returns_single_round() {
        let engine = Arc::new(FakeEngine {
            round1: vec![result("e1", 0.5)],
            by_query: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        });
        let llm = Arc::new(ScriptedLlm(Ok(
            r#"{"is_sufficient": true, "reasoning": "covers it", "refined_queries": []}"#.into(),
        )));
        let agentic = AgenticRetriever::new(engine.clone(), llm, AgenticConfig::default());

        let response = agentic.search(&request()).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(
            response.metadata.get("is_sufficient").unwrap(),
            &serde_json::json!(true)
        );
        assert_eq!(
            response.metadata.get("is_multi_round").unwrap(),
            &serde_json::json!(false)
        );
        assert_eq!(engine.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_triggers_second_round() {
        let mut by_query = HashMap::new();
        by_query.insert(
            "coffee preferences".to_string(),
            vec![result("e2", 0.9), result("e1", 0.2)],
        );
        by_query.insert("travel plans".to_string(), vec![result("e3", 0.7)]);

        let engine = Arc::new(FakeEngine {
            round1: vec![result("e1", 0.5), result("e4", 0.1)],
            by_query,
            calls: Mutex::new(Vec::new()),
        });
        let llm = Arc::new(ScriptedLlm(Ok(
            r#"{"is_sufficient": false, "reasoning": "summaries are empty", "refined_queries": ["coffee preferences", "travel plans"]}"#.into(),
        )));
        let agentic = AgenticRetriever::new(engine.clone(), llm, AgenticConfig::default());

        let response = agentic.search(&request()).await.unwrap();

        assert_eq!(
            response.metadata.get("is_multi_round").unwrap(),
            &serde_json::json!(true)
        );
        assert_eq!(
            response.metadata.get("round1_count").unwrap(),
            &serde_json::json!(2)
        );
        assert_eq!(
            response.metadata.get("refined_queries").unwrap(),
            &serde_json::json!(["coffee preferences", "travel plans"])
        );
        let round2: u64 = response
            .metadata
            .get("round2_count")
            .and_then(|v| v.as_u64())
            .unwrap();
        assert!(round2 >= 1);

        // Merged by max score: e1 appears in both rounds, keeps 0.5
        let e1 = response.results.iter().find(|r| r.event_id == "e1").unwrap();
        assert!((e1.score - 0.5).abs() < 1e-6);
        // Highest refined score wins the ranking
        assert_eq!(response.results[0].event_id, "e2");
        // All three calls went through the engine (round 1 + 2 refined)
        assert_eq!(engine.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_judge_failure_falls_back_to_round1() {
        let engine = Arc::new(FakeEngine {
            round1: vec![result("e1", 0.5)],
            by_query: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        });
        let llm = Arc::new(ScriptedLlm(Err(())));
        let agentic = AgenticRetriever::new(engine, llm, AgenticConfig::default());

        let response = agentic.search(&request()).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(
            response.metadata.get("retrieval_mode").unwrap(),
            &serde_json::json!("agentic_fallback")
        );
    }

    #[tokio::test]
    async fn test_unparseable_judge_falls_back() {
        let engine = Arc::new(FakeEngine {
            round1: vec![result("e1", 0.5)],
            by_query: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        });
        let llm = Arc::new(ScriptedLlm(Ok("not json at all".into())));
        let agentic = AgenticRetriever::new(engine, llm, AgenticConfig::default());

        let response = agentic.search(&request()).await.unwrap();
        assert_eq!(
            response.metadata.get("retrieval_mode").unwrap(),
            &serde_json::json!("agentic_fallback")
        );
    }

    #[test]
    fn test_merge_by_max_score_dedups() {
        let merged = merge_by_max_score(
            [
                vec![result("a", 0.3), result("b", 0.2)],
                vec![result("a", 0.9), result("c", 0.5)],
            ],
            10,
        );
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].event_id, "a");
        assert!((merged[0].score - 0.9).abs() < 1e-6);
        assert_eq!(merged[1].event_id, "c");
    }

    #[test]
    fn test_merge_truncates_to_top_k() {
        let merged = merge_by_max_score(
            [vec![result("a", 0.9), result("b", 0.8), result("c", 0.7)]],
            2,
        );
        assert_eq!(merged.len(), 2);
    }
}
