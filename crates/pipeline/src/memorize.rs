//! Memorize pipeline
//!
//! Per-message flow: append to the group buffer, replay it, ask the
//! boundary detector, and on a cut extract + persist a MemCell, batch
//! MemCells into Episodes, and slice the emitted prefix off the buffer.
//! A keyed async lock serializes the whole flow per group.

use chatmem_cache::{BufferCache, QueueItem, QueuePayload};
use chatmem_config::constants::queue::BUFFER_KEY_PREFIX;
use chatmem_core::{EpisodeSegment, RawMessage};
use chatmem_extraction::{BoundaryDecision, BoundaryDetector, EpisodeExtractor, MemCellExtractor};
use chatmem_storage::TripleStoreWriter;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::dispatcher::MessageProcessor;
use crate::PipelineError;

/// How many consecutive write failures a segment survives in the buffer
/// before it is dropped
const MAX_WRITE_RETRIES: u32 = 3;

/// Result of processing one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Buffered; the boundary has not fired
    Accumulated,
    /// One or more records were persisted
    Extracted { event_ids: Vec<String> },
}

#[derive(Default)]
struct GroupState {
    /// Event ids of MemCells not yet folded into an Episode
    unlinked_event_ids: Vec<String>,
    /// Consecutive triple-store failures for the current segment
    write_failures: u32,
}

/// Per-group orchestrator of the memorize flow
pub struct MemorizePipeline {
    cache: Arc<dyn BufferCache>,
    boundary: BoundaryDetector,
    memcell: MemCellExtractor,
    episode: EpisodeExtractor,
    writer: Arc<TripleStoreWriter>,
    groups: DashMap<String, Arc<Mutex<GroupState>>>,
    episode_batch_size: usize,
}

impl MemorizePipeline {
    pub fn new(
        cache: Arc<dyn BufferCache>,
        boundary: BoundaryDetector,
        memcell: MemCellExtractor,
        episode: EpisodeExtractor,
        writer: Arc<TripleStoreWriter>,
        episode_batch_size: usize,
    ) -> Self {
        Self {
            cache,
            boundary,
            memcell,
            episode,
            writer,
            groups: DashMap::new(),
            episode_batch_size: episode_batch_size.max(1),
        }
    }

    fn buffer_key(routing_key: &str) -> String {
        format!("{BUFFER_KEY_PREFIX}{routing_key}")
    }

    fn group_lock(&self, routing_key: &str) -> Arc<Mutex<GroupState>> {
        self.groups
            .entry(routing_key.to_string())
            .or_default()
            .clone()
    }

    /// Decode buffered items into messages; malformed entries are logged
    /// and skipped, they never stall the group
    fn decode_buffer(items: &[QueueItem]) -> Vec<(usize, RawMessage)> {
        let mut messages = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let Some(json) = item.payload.as_json() else {
                tracing::warn!(id = %item.id, "non-json member in message buffer, skipping");
                continue;
            };
            match serde_json::from_value::<RawMessage>(json.clone()) {
                Ok(message) => messages.push((index, message)),
                Err(e) => {
                    tracing::warn!(id = %item.id, error = %e, "undecodable message in buffer, skipping");
                }
            }
        }
        messages
    }

    /// Build the closed segment for the first `cut_index` messages
    fn slice_segment(messages: &[RawMessage], cut_index: usize, group_id: &str) -> EpisodeSegment {
        let cut = cut_index.min(messages.len()).max(1);
        let emitted = &messages[..cut];
        let current_time = emitted
            .last()
            .map(|m| m.timestamp)
            .expect("segment is non-empty");

        // The newest emitted message is the one that triggered the cut
        EpisodeSegment {
            history: emitted[..cut - 1].to_vec(),
            new: vec![emitted[cut - 1].clone()],
            group_id: group_id.to_string(),
            current_time,
        }
    }

    /// Replace the buffer with the unemitted tail, keeping original ids
    /// and scores
    async fn remove_emitted(
        &self,
        buffer_key: &str,
        items: &[QueueItem],
        emitted_indices: &[usize],
    ) -> Result<(), PipelineError> {
        let remainder: Vec<QueueItem> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| !emitted_indices.contains(i))
            .map(|(_, item)| item.clone())
            .collect();

        self.cache.clear(buffer_key).await?;
        self.cache.restore(buffer_key, &remainder).await?;
        Ok(())
    }

    /// Fold the group's unlinked MemCells into one Episode when the batch
    /// threshold is reached. Failures keep the batch for the next attempt.
    async fn maybe_derive_episode(&self, state: &mut GroupState) -> Option<String> {
        if state.unlinked_event_ids.len() < self.episode_batch_size {
            return None;
        }

        let batch: Vec<String> = state
            .unlinked_event_ids
            .iter()
            .take(self.episode_batch_size)
            .cloned()
            .collect();

        let cells = match self.writer.records().get_many(&batch).await {
            Ok(cells) if !cells.is_empty() => cells,
            Ok(_) => {
                tracing::warn!("episode batch resolved to no records, clearing");
                state.unlinked_event_ids.drain(..batch.len());
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load memcells for episode");
                return None;
            }
        };

        let episode = match self.episode.extract(&cells).await {
            Ok(episode) => episode,
            Err(e) => {
                tracing::error!(error = %e, "episode extraction failed, keeping batch");
                return None;
            }
        };

        match self.writer.write(episode).await {
            Ok(receipt) => {
                state.unlinked_event_ids.drain(..batch.len());
                metrics::counter!("chatmem_episodes_written_total").increment(1);
                tracing::info!(event_id = %receipt.event_id, cells = batch.len(), "episode derived");
                Some(receipt.event_id)
            }
            Err(e) => {
                tracing::error!(error = %e, "episode write failed, keeping batch");
                None
            }
        }
    }
}

#[async_trait]
impl MessageProcessor for MemorizePipeline {
    async fn process(&self, message: &RawMessage) -> Result<ProcessOutcome, PipelineError> {
        let routing_key = message.routing_key().to_string();
        let buffer_key = Self::buffer_key(&routing_key);

        // Step 1: buffer the message under its own timestamp
        let payload = QueuePayload::Json(
            serde_json::to_value(message)
                .expect("raw message serializes"),
        );
        self.cache
            .append(&buffer_key, &payload, Some(message.timestamp_millis()))
            .await?;

        // Steps 2-6 run under the group lock: one extraction per group
        let lock = self.group_lock(&routing_key);
        let mut state = lock.lock().await;

        // Step 2: replay the full buffer in arrival order
        let items = self.cache.range_ascending(&buffer_key, None, None, None).await?;
        let decoded = Self::decode_buffer(&items);
        if decoded.is_empty() {
            return Ok(ProcessOutcome::Accumulated);
        }

        // Step 3: all-but-last is history, the newest message is `new`
        let messages: Vec<RawMessage> = decoded.iter().map(|(_, m)| m.clone()).collect();
        let (history, new) = messages.split_at(messages.len() - 1);

        // Step 4: boundary decision
        let decision = self.boundary.decide(history, new).await;
        let cut_index = match decision {
            BoundaryDecision::Emit { cut_index } => cut_index,
            BoundaryDecision::Wait { reason } => {
                tracing::debug!(group = %routing_key, reason, buffered = messages.len(), "boundary not reached");
                return Ok(ProcessOutcome::Accumulated);
            }
        };

        // Step 5: extract and persist the closed segment
        let segment = Self::slice_segment(&messages, cut_index, &message.group_id);
        let cell = match self.memcell.extract(&segment).await {
            Ok(cell) => cell,
            Err(e) => {
                // Segment dropped, buffer intact; later messages re-trigger
                tracing::error!(group = %routing_key, error = %e, "memcell extraction failed, dropping segment");
                metrics::counter!("chatmem_extraction_failures_total").increment(1);
                return Ok(ProcessOutcome::Accumulated);
            }
        };

        let receipt = match self.writer.write(cell).await {
            Ok(receipt) => receipt,
            Err(e) => {
                state.write_failures += 1;
                if state.write_failures >= MAX_WRITE_RETRIES {
                    // Give up on this segment; drop it from the buffer so
                    // the group can move on
                    tracing::error!(
                        group = %routing_key,
                        attempts = state.write_failures,
                        error = %e,
                        segment_len = cut_index,
                        "triple write failed repeatedly, dropping segment"
                    );
                    let emitted: Vec<usize> =
                        decoded.iter().take(cut_index).map(|(i, _)| *i).collect();
                    self.remove_emitted(&buffer_key, &items, &emitted).await?;
                    state.write_failures = 0;
                } else {
                    tracing::warn!(
                        group = %routing_key,
                        attempt = state.write_failures,
                        error = %e,
                        "triple write failed, segment stays buffered"
                    );
                }
                return Err(e.into());
            }
        };
        state.write_failures = 0;

        // The MemCell commits before any Episode write begins
        let mut event_ids = vec![receipt.event_id.clone()];
        state.unlinked_event_ids.push(receipt.event_id);
        if let Some(episode_id) = self.maybe_derive_episode(&mut state).await {
            event_ids.push(episode_id);
        }

        // Step 6: slice the emitted prefix off the buffer
        let emitted: Vec<usize> = decoded.iter().take(cut_index).map(|(i, _)| *i).collect();
        self.remove_emitted(&buffer_key, &items, &emitted).await?;

        metrics::counter!("chatmem_memcells_written_total").increment(1);
        tracing::info!(
            group = %routing_key,
            emitted = cut_index,
            records = event_ids.len(),
            "segment extracted"
        );
        Ok(ProcessOutcome::Extracted { event_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmem_core::Scene;
    use chrono::{FixedOffset, TimeZone};

    fn msg(id: &str, minute: u32) -> RawMessage {
        RawMessage {
            message_id: id.into(),
            group_id: "g1".into(),
            group_name: String::new(),
            sender_id: "alice".into(),
            sender_name: None,
            content: format!("content {id}"),
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 6, 1, 9, minute, 0)
                .unwrap(),
            refer_list: Vec::new(),
            scene: Scene::GroupChat,
        }
    }

    fn item(message: &RawMessage) -> QueueItem {
        QueueItem {
            id: format!("id-{}", message.message_id),
            payload: QueuePayload::Json(serde_json::to_value(message).unwrap()),
            score: message.timestamp_millis(),
        }
    }

    #[test]
    fn test_decode_buffer_skips_malformed() {
        let good = msg("m1", 0);
        let items = vec![
            item(&good),
            QueueItem {
                id: "junk".into(),
                payload: QueuePayload::Json(serde_json::json!({"not": "a message"})),
                score: 1,
            },
            QueueItem {
                id: "binary".into(),
                payload: QueuePayload::Bytes(vec![1, 2, 3]),
                score: 2,
            },
        ];

        let decoded = MemorizePipeline::decode_buffer(&items);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, 0);
        assert_eq!(decoded[0].1.message_id, "m1");
    }

    #[test]
    fn test_slice_segment_marks_trigger_message() {
        let messages: Vec<RawMessage> = (0..5).map(|i| msg(&format!("m{i}"), i)).collect();
        let segment = MemorizePipeline::slice_segment(&messages, 3, "g1");

        assert_eq!(segment.len(), 3);
        assert_eq!(segment.history.len(), 2);
        assert_eq!(segment.new.len(), 1);
        assert_eq!(segment.new[0].message_id, "m2");
        assert_eq!(segment.first_timestamp().unwrap(), messages[0].timestamp);
        assert_eq!(segment.current_time, messages[2].timestamp);
    }

    #[test]
    fn test_slice_segment_clamps_cut() {
        let messages: Vec<RawMessage> = (0..2).map(|i| msg(&format!("m{i}"), i)).collect();
        let segment = MemorizePipeline::slice_segment(&messages, 99, "g1");
        assert_eq!(segment.len(), 2);
    }

    #[test]
    fn test_buffer_key_namespacing() {
        assert_eq!(
            MemorizePipeline::buffer_key("g1"),
            "memcell:buffer:g1"
        );
    }
}
