//! MemCell extraction
//!
//! Turns one closed `EpisodeSegment` into a `MemoryRecord` carrying the
//! verbatim source messages. Subject, summary, and keywords come from the
//! LLM; everything else is derived from the segment itself.

use chatmem_core::{EpisodeSegment, MemoryRecord, RecordType};
use chatmem_llm::{extract_json_object, LlmBackend, Message};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::prompts;
use crate::ExtractionError;

#[derive(Debug, Deserialize)]
struct MemCellResponse {
    subject: String,
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    entities: Vec<String>,
}

/// Extracts one MemCell per closed segment
pub struct MemCellExtractor {
    llm: Arc<dyn LlmBackend>,
}

impl MemCellExtractor {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }

    /// Extract a MemCell. `event_id` is left empty; the triple-store writer
    /// assigns it at write time.
    pub async fn extract(&self, segment: &EpisodeSegment) -> Result<MemoryRecord, ExtractionError> {
        let timestamp = segment
            .first_timestamp()
            .ok_or(ExtractionError::EmptySegment)?;

        let prompt = prompts::memcell_prompt(segment);
        let result = self.llm.generate(&[Message::user(prompt)]).await?;

        let json = extract_json_object(&result.text).ok_or_else(|| {
            ExtractionError::InvalidResponse("no json object in memcell response".into())
        })?;
        let parsed: MemCellResponse = serde_json::from_str(json)
            .map_err(|e| ExtractionError::InvalidResponse(e.to_string()))?;

        if parsed.subject.trim().is_empty() && parsed.summary.trim().is_empty() {
            return Err(ExtractionError::InvalidResponse(
                "memcell response has neither subject nor summary".into(),
            ));
        }

        // Group chats produce group-scoped cells; private chats bind the
        // cell to its single participant.
        let (user_id, group_id) = if segment.group_id.is_empty() {
            let sender = segment
                .messages()
                .next()
                .map(|m| m.sender_id.clone())
                .unwrap_or_default();
            (sender, String::new())
        } else {
            (String::new(), segment.group_id.clone())
        };

        let now = Utc::now();
        Ok(MemoryRecord {
            event_id: String::new(),
            user_id,
            group_id,
            participants: segment.participants(),
            timestamp,
            record_type: RecordType::Conversation,
            subject: parsed.subject.trim().to_string(),
            summary: parsed.summary.trim().to_string(),
            keywords: parsed
                .keywords
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            linked_entities: {
                let mut entities: Vec<String> = parsed
                    .entities
                    .into_iter()
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect();
                entities.dedup();
                entities
            },
            original_data: segment.messages().cloned().collect(),
            memcell_event_id_list: Vec::new(),
            episode: String::new(),
            start_time: None,
            end_time: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatmem_core::{RawMessage, Scene};
    use chatmem_llm::{GenerationResult, LlmError};
    use chrono::{FixedOffset, TimeZone};

    struct FixedLlm(String);

    #[async_trait]
    impl LlmBackend for FixedLlm {
        async fn generate(&self, _: &[Message]) -> Result<GenerationResult, LlmError> {
            Ok(GenerationResult {
                text: self.0.clone(),
                completion_tokens: 0,
                total_time_ms: 1,
            })
        }

        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    fn segment(group_id: &str) -> EpisodeSegment {
        let base = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
            .unwrap();
        let mk = |id: &str, sender: &str, minute: i64| RawMessage {
            message_id: id.into(),
            group_id: group_id.into(),
            group_name: String::new(),
            sender_id: sender.into(),
            sender_name: None,
            content: format!("msg {id}"),
            timestamp: base + chrono::Duration::minutes(minute),
            refer_list: Vec::new(),
            scene: Scene::GroupChat,
        };
        EpisodeSegment {
            history: vec![mk("m1", "alice", 0), mk("m2", "bob", 1)],
            new: vec![mk("m3", "alice", 2)],
            group_id: group_id.into(),
            current_time: base + chrono::Duration::minutes(2),
        }
    }

    #[tokio::test]
    async fn test_extract_builds_record_from_segment() {
        let llm = Arc::new(FixedLlm(
            r#"{"subject": "Lunch plans", "summary": "Alice and Bob agreed on ramen.", "keywords": ["lunch", "ramen", " "], "entities": ["Ichiran"]}"#.into(),
        ));
        let extractor = MemCellExtractor::new(llm);

        let cell = extractor.extract(&segment("g1")).await.unwrap();
        assert!(cell.event_id.is_empty());
        assert_eq!(cell.group_id, "g1");
        assert_eq!(cell.user_id, "");
        assert_eq!(cell.subject, "Lunch plans");
        assert_eq!(cell.keywords, vec!["lunch", "ramen"]);
        assert_eq!(cell.linked_entities, vec!["Ichiran"]);
        assert_eq!(cell.participants, vec!["alice", "bob"]);
        assert_eq!(cell.original_data.len(), 3);
        assert_eq!(cell.record_type, RecordType::Conversation);
        // timestamp inherited from the first message
        assert_eq!(
            cell.timestamp,
            segment("g1").first_timestamp().unwrap()
        );
        assert!(!cell.is_episode());
    }

    #[tokio::test]
    async fn test_private_chat_binds_to_sender() {
        let llm = Arc::new(FixedLlm(
            r#"{"subject": "s", "summary": "x", "keywords": []}"#.into(),
        ));
        let extractor = MemCellExtractor::new(llm);

        let cell = extractor.extract(&segment("")).await.unwrap();
        assert_eq!(cell.user_id, "alice");
        assert_eq!(cell.group_id, "");
    }

    #[tokio::test]
    async fn test_garbage_response_is_extraction_error() {
        let llm = Arc::new(FixedLlm("I refuse to answer in JSON".into()));
        let extractor = MemCellExtractor::new(llm);
        let err = extractor.extract(&segment("g1")).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_blank_subject_and_summary_rejected() {
        let llm = Arc::new(FixedLlm(
            r#"{"subject": " ", "summary": "", "keywords": []}"#.into(),
        ));
        let extractor = MemCellExtractor::new(llm);
        assert!(extractor.extract(&segment("g1")).await.is_err());
    }
}
