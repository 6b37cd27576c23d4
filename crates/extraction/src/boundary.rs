//! Conversation boundary detection
//!
//! Decides whether a buffered conversation has reached a natural semantic
//! end. The LLM makes the call in the common case; two hard rules override
//! it: a long silence always cuts, and a buffer over `hard_cut_count`
//! always emits so the queue bound cannot starve extraction.

use chatmem_config::{constants::boundary as limits, BoundaryConfig};
use chatmem_core::RawMessage;
use chatmem_llm::{extract_json_object, LlmBackend, Message};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::prompts;
use crate::ExtractionError;

/// Outcome of a boundary check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryDecision {
    /// The first `cut_index` messages of history+new form a closed episode
    Emit { cut_index: usize },
    /// Keep buffering
    Wait { reason: &'static str },
}

impl BoundaryDecision {
    pub fn is_emit(&self) -> bool {
        matches!(self, BoundaryDecision::Emit { .. })
    }
}

/// Constrained response the LLM must produce
#[derive(Debug, Deserialize)]
struct BoundaryResponse {
    boundary: bool,
    #[serde(default)]
    cut_index: usize,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

/// LLM-guided boundary detector with hard-cut overrides
pub struct BoundaryDetector {
    llm: Arc<dyn LlmBackend>,
    config: BoundaryConfig,
}

impl BoundaryDetector {
    pub fn new(llm: Arc<dyn LlmBackend>, config: BoundaryConfig) -> Self {
        Self { llm, config }
    }

    /// Decide whether `history + new` contains a closed episode.
    ///
    /// Never emits while `new` is empty or the buffer holds two or fewer
    /// messages. Returns `Wait` rather than an error on every LLM failure
    /// mode: the next message retries, and delaying extraction is cheaper
    /// than losing buffered data.
    pub async fn decide(
        &self,
        history: &[RawMessage],
        new: &[RawMessage],
    ) -> BoundaryDecision {
        if new.is_empty() {
            return BoundaryDecision::Wait {
                reason: "no_new_messages",
            };
        }

        let total = history.len() + new.len();
        if total <= limits::MIN_MESSAGES {
            return BoundaryDecision::Wait { reason: "need_more" };
        }

        // A silence gap longer than hard_cut_minutes closes the segment at
        // the gap, no LLM consulted.
        if let Some(cut_index) = self.silence_cut(history, new) {
            tracing::debug!(cut_index, total, "hard cut on silence gap");
            return BoundaryDecision::Emit { cut_index };
        }

        let llm_decision = self.ask_llm(history, new, total).await;

        // An oversized buffer must emit: take the LLM's cut when it offered
        // one, otherwise flush the whole buffer.
        if total > self.config.hard_cut_count {
            let cut_index = match llm_decision {
                Some(BoundaryResponse {
                    boundary: true,
                    cut_index,
                    ..
                }) if (1..=total).contains(&cut_index) => cut_index,
                _ => total,
            };
            tracing::info!(cut_index, total, "hard cut on buffer size");
            return BoundaryDecision::Emit { cut_index };
        }

        match llm_decision {
            Some(BoundaryResponse {
                boundary: true,
                cut_index,
                ..
            }) if (1..=total).contains(&cut_index) => BoundaryDecision::Emit { cut_index },
            Some(BoundaryResponse { boundary: true, .. }) => {
                tracing::warn!(total, "llm boundary with out-of-range cut index, waiting");
                BoundaryDecision::Wait {
                    reason: "invalid_cut_index",
                }
            }
            Some(_) => BoundaryDecision::Wait { reason: "need_more" },
            None => BoundaryDecision::Wait {
                reason: "llm_unavailable",
            },
        }
    }

    /// First silence gap exceeding the hard-cut threshold, as a cut index
    fn silence_cut(&self, history: &[RawMessage], new: &[RawMessage]) -> Option<usize> {
        let all: Vec<&RawMessage> = history.iter().chain(new.iter()).collect();
        let threshold = chrono::Duration::minutes(self.config.hard_cut_minutes);

        for (i, pair) in all.windows(2).enumerate() {
            let gap = pair[1].timestamp.signed_duration_since(pair[0].timestamp);
            if gap > threshold {
                // Everything before the gap is one closed episode
                return Some(i + 1);
            }
        }
        None
    }

    /// Ask the LLM with retry and exponential backoff; `None` means every
    /// attempt failed or parsed to garbage.
    async fn ask_llm(
        &self,
        history: &[RawMessage],
        new: &[RawMessage],
        total: usize,
    ) -> Option<BoundaryResponse> {
        let current_time = new.last().map(|m| m.timestamp)?;
        let prompt = prompts::boundary_prompt(history, new, current_time);
        let messages = [Message::user(prompt)];

        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.llm.generate(&messages).await {
                Ok(result) => {
                    return match parse_boundary_response(&result.text) {
                        Ok(parsed) => Some(parsed),
                        Err(e) => {
                            tracing::warn!(total, error = %e, "unparseable boundary response");
                            None
                        }
                    };
                }
                Err(e) if attempt < self.config.max_retries => {
                    tracing::warn!(attempt, error = %e, "boundary llm call failed, retrying");
                }
                Err(e) => {
                    tracing::error!(error = %e, "boundary llm call failed after retries");
                    return None;
                }
            }
        }
        None
    }
}

fn parse_boundary_response(text: &str) -> Result<BoundaryResponse, ExtractionError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ExtractionError::InvalidResponse("no json object in response".into()))?;
    serde_json::from_str(json).map_err(|e| ExtractionError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatmem_core::Scene;
    use chatmem_llm::{GenerationResult, LlmError};
    use chrono::{FixedOffset, TimeZone};
    use parking_lot::Mutex;

    /// Scripted backend: pops responses front-to-back, counts calls
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            })
        }

        fn call_count(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedLlm {
        async fn generate(&self, _: &[Message]) -> Result<GenerationResult, LlmError> {
            *self.calls.lock() += 1;
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(LlmError::Api("no scripted response".into()));
            }
            responses.remove(0).map(|text| GenerationResult {
                text,
                completion_tokens: 0,
                total_time_ms: 1,
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn msg_at(id: &str, minute: i64) -> RawMessage {
        RawMessage {
            message_id: id.into(),
            group_id: "g1".into(),
            group_name: String::new(),
            sender_id: "alice".into(),
            sender_name: None,
            content: format!("message {id}"),
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
                .unwrap()
                + chrono::Duration::minutes(minute),
            refer_list: Vec::new(),
            scene: Scene::Assistant,
        }
    }

    fn config() -> BoundaryConfig {
        BoundaryConfig {
            max_retries: 1,
            retry_backoff_ms: 1,
            hard_cut_minutes: 30,
            hard_cut_count: 100,
        }
    }

    #[tokio::test]
    async fn test_never_emits_on_empty_new() {
        let llm = ScriptedLlm::new(vec![]);
        let detector = BoundaryDetector::new(llm.clone(), config());
        let history = vec![msg_at("m1", 0), msg_at("m2", 1), msg_at("m3", 2)];

        let decision = detector.decide(&history, &[]).await;
        assert_eq!(
            decision,
            BoundaryDecision::Wait {
                reason: "no_new_messages"
            }
        );
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_never_emits_at_two_messages() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"{"boundary": true, "cut_index": 2, "reason": ""}"#.into()
        )]);
        let detector = BoundaryDetector::new(llm.clone(), config());

        let decision = detector
            .decide(&[msg_at("m1", 0)], &[msg_at("m2", 1)])
            .await;
        assert!(!decision.is_emit());
        // The LLM is not even consulted below the floor
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_silence_gap_cuts_without_llm() {
        let llm = ScriptedLlm::new(vec![]);
        let detector = BoundaryDetector::new(llm.clone(), config());

        let history = vec![msg_at("m1", 0), msg_at("m2", 1), msg_at("m3", 2)];
        let new = vec![msg_at("m4", 33)]; // 31 minutes after m3

        let decision = detector.decide(&history, &new).await;
        assert_eq!(decision, BoundaryDecision::Emit { cut_index: 3 });
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_emit_decision() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"{"boundary": true, "cut_index": 5, "reason": "farewell"}"#.into(),
        )]);
        let detector = BoundaryDetector::new(llm, config());

        let history: Vec<_> = (0..4).map(|i| msg_at(&format!("m{i}"), i)).collect();
        let new = vec![msg_at("m4", 4)];

        let decision = detector.decide(&history, &new).await;
        assert_eq!(decision, BoundaryDecision::Emit { cut_index: 5 });
    }

    #[tokio::test]
    async fn test_unparseable_response_waits() {
        let llm = ScriptedLlm::new(vec![Ok("definitely not json".into())]);
        let detector = BoundaryDetector::new(llm, config());

        let history: Vec<_> = (0..3).map(|i| msg_at(&format!("m{i}"), i)).collect();
        let decision = detector.decide(&history, &[msg_at("m3", 3)]).await;
        assert_eq!(
            decision,
            BoundaryDecision::Wait {
                reason: "llm_unavailable"
            }
        );
    }

    #[tokio::test]
    async fn test_llm_failure_retries_then_waits() {
        let llm = ScriptedLlm::new(vec![
            Err(LlmError::Network("down".into())),
            Err(LlmError::Network("still down".into())),
        ]);
        let detector = BoundaryDetector::new(llm.clone(), config());

        let history: Vec<_> = (0..3).map(|i| msg_at(&format!("m{i}"), i)).collect();
        let decision = detector.decide(&history, &[msg_at("m3", 3)]).await;
        assert!(!decision.is_emit());
        // initial attempt + one retry (max_retries = 1)
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_oversized_buffer_force_emits_whole() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"{"boundary": false, "cut_index": 0, "reason": "ongoing"}"#.into(),
        )]);
        let mut cfg = config();
        cfg.hard_cut_count = 4;
        let detector = BoundaryDetector::new(llm, cfg);

        let history: Vec<_> = (0..5).map(|i| msg_at(&format!("m{i}"), i)).collect();
        let decision = detector.decide(&history, &[msg_at("m5", 5)]).await;
        assert_eq!(decision, BoundaryDecision::Emit { cut_index: 6 });
    }

    #[tokio::test]
    async fn test_oversized_buffer_prefers_llm_cut() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"{"boundary": true, "cut_index": 3, "reason": "topic change"}"#.into(),
        )]);
        let mut cfg = config();
        cfg.hard_cut_count = 4;
        let detector = BoundaryDetector::new(llm, cfg);

        let history: Vec<_> = (0..5).map(|i| msg_at(&format!("m{i}"), i)).collect();
        let decision = detector.decide(&history, &[msg_at("m5", 5)]).await;
        assert_eq!(decision, BoundaryDecision::Emit { cut_index: 3 });
    }

    #[tokio::test]
    async fn test_out_of_range_cut_index_waits() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"{"boundary": true, "cut_index": 99, "reason": ""}"#.into(),
        )]);
        let detector = BoundaryDetector::new(llm, config());

        let history: Vec<_> = (0..3).map(|i| msg_at(&format!("m{i}"), i)).collect();
        let decision = detector.decide(&history, &[msg_at("m3", 3)]).await;
        assert_eq!(
            decision,
            BoundaryDecision::Wait {
                reason: "invalid_cut_index"
            }
        );
    }
}
