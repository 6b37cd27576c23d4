//! Episode derivation
//!
//! Once a group accumulates `episode_batch_size` unlinked MemCells, this
//! extractor summarizes them (oldest first) into one Episode record that
//! back-references the constituent cells. The cells themselves are never
//! mutated.

use chatmem_core::{MemoryRecord, RecordType};
use chatmem_llm::{extract_json_object, LlmBackend, Message};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::prompts;
use crate::ExtractionError;

#[derive(Debug, Deserialize)]
struct EpisodeResponse {
    title: String,
    #[serde(default)]
    summary: String,
    episode: String,
    #[serde(default)]
    search_phrases: Vec<String>,
}

/// Derives an Episode summary over a batch of MemCells
pub struct EpisodeExtractor {
    llm: Arc<dyn LlmBackend>,
}

impl EpisodeExtractor {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }

    /// Summarize `cells` (ordered oldest first) into one Episode record.
    /// `event_id` is assigned at write time, like for MemCells.
    pub async fn extract(&self, cells: &[MemoryRecord]) -> Result<MemoryRecord, ExtractionError> {
        let first = cells.first().ok_or(ExtractionError::EmptySegment)?;

        let prompt = prompts::episode_prompt(cells);
        let result = self.llm.generate(&[Message::user(prompt)]).await?;

        let json = extract_json_object(&result.text).ok_or_else(|| {
            ExtractionError::InvalidResponse("no json object in episode response".into())
        })?;
        let parsed: EpisodeResponse = serde_json::from_str(json)
            .map_err(|e| ExtractionError::InvalidResponse(e.to_string()))?;

        if parsed.episode.trim().is_empty() {
            return Err(ExtractionError::InvalidResponse(
                "episode response has an empty narrative".into(),
            ));
        }

        let participants: BTreeSet<String> = cells
            .iter()
            .flat_map(|c| c.participants.iter().cloned())
            .collect();

        let now = Utc::now();
        Ok(MemoryRecord {
            event_id: String::new(),
            user_id: first.user_id.clone(),
            group_id: first.group_id.clone(),
            participants: participants.into_iter().collect(),
            timestamp: first.timestamp,
            record_type: RecordType::Episode,
            subject: parsed.title.trim().to_string(),
            summary: parsed.summary.trim().to_string(),
            keywords: parsed
                .search_phrases
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            linked_entities: Vec::new(),
            original_data: Vec::new(),
            memcell_event_id_list: cells.iter().map(|c| c.event_id.clone()).collect(),
            episode: parsed.episode.trim().to_string(),
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

    fn cell(event_id: &str, minute: u32, participants: &[&str]) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            event_id: event_id.into(),
            user_id: String::new(),
            group_id: "g1".into(),
            participants: participants.iter().map(|s| s.to_string()).collect(),
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 6, 1, 9, minute, 0)
                .unwrap(),
            record_type: RecordType::Conversation,
            subject: format!("subject {event_id}"),
            summary: format!("summary {event_id}"),
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

    #[tokio::test]
    async fn test_episode_links_all_cells() {
        let llm = Arc::new(FixedLlm(
            r#"{"title": "Planning week", "summary": "A week of planning.", "episode": "The group spent the week planning the launch.", "search_phrases": ["launch planning"]}"#.into(),
        ));
        let extractor = EpisodeExtractor::new(llm);

        let cells = vec![
            cell("ev-1", 0, &["alice"]),
            cell("ev-2", 5, &["bob"]),
            cell("ev-3", 9, &["alice", "carol"]),
        ];
        let episode = extractor.extract(&cells).await.unwrap();

        assert!(episode.is_episode());
        assert_eq!(episode.record_type, RecordType::Episode);
        assert_eq!(
            episode.memcell_event_id_list,
            vec!["ev-1", "ev-2", "ev-3"]
        );
        assert_eq!(episode.participants, vec!["alice", "bob", "carol"]);
        assert_eq!(episode.timestamp, cells[0].timestamp);
        assert_eq!(episode.keywords, vec!["launch planning"]);
        assert!(!episode.episode.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let llm = Arc::new(FixedLlm("{}".into()));
        let extractor = EpisodeExtractor::new(llm);
        assert!(matches!(
            extractor.extract(&[]).await,
            Err(ExtractionError::EmptySegment)
        ));
    }

    #[tokio::test]
    async fn test_empty_narrative_rejected() {
        let llm = Arc::new(FixedLlm(
            r#"{"title": "t", "summary": "s", "episode": "  ", "search_phrases": []}"#.into(),
        ));
        let extractor = EpisodeExtractor::new(llm);
        let cells = vec![cell("ev-1", 0, &["alice"])];
        assert!(extractor.extract(&cells).await.is_err());
    }
}
