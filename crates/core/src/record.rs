//! Persisted record model
//!
//! The document store, text index, and vector index all hold the same
//! logical `MemoryRecord`. MemCells and Episodes share one shape; readers
//! tell them apart by whether `memcell_event_id_list` is populated. The
//! record kind is also stored explicitly so filtered queries never need a
//! presence-of-field check.

use crate::message::RawMessage;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// MemCell extracted from a conversation segment
    #[default]
    Conversation,
    /// MemCell extracted from an ingested document
    Document,
    /// MemCell from another source
    Other,
    /// Second-order summary grouping several MemCells
    Episode,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Document => "document",
            Self::Other => "other",
            Self::Episode => "episode",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "document" => Self::Document,
            "other" => Self::Other,
            "episode" => Self::Episode,
            _ => Self::Conversation,
        }
    }
}

/// One unit of persisted memory
///
/// An empty `user_id` means the record is group-scoped; an empty `group_id`
/// means it is personal. `event_id` is assigned by the triple-store writer
/// and is identical across all three backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub event_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(rename = "type", default)]
    pub record_type: RecordType,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub linked_entities: Vec<String>,
    /// Source messages, verbatim
    #[serde(default)]
    pub original_data: Vec<RawMessage>,
    /// Empty on a plain MemCell; the constituent cell ids on an Episode
    #[serde(default)]
    pub memcell_event_id_list: Vec<String>,
    /// Long-form narrative; only Episodes carry one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub episode: String,
    /// Validity window for semantic-style records; both bounds must be
    /// present for the validity filter to apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<FixedOffset>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Whether this record is an Episode summary rather than a MemCell
    pub fn is_episode(&self) -> bool {
        !self.memcell_event_id_list.is_empty()
    }

    /// The text handed to the embedder and the text index. Subject, summary
    /// and narrative concatenated; keywords appended so keyword-only
    /// records stay searchable.
    pub fn search_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(4);
        if !self.subject.is_empty() {
            parts.push(&self.subject);
        }
        if !self.summary.is_empty() {
            parts.push(&self.summary);
        }
        if !self.episode.is_empty() {
            parts.push(&self.episode);
        }
        let mut text = parts.join("\n");
        if !self.keywords.is_empty() {
            text.push('\n');
            text.push_str(&self.keywords.join(" "));
        }
        text
    }

    /// Indexable phrases for the text index `search_content` field
    pub fn search_content(&self) -> Vec<String> {
        let mut content = Vec::with_capacity(3 + self.keywords.len());
        if !self.subject.is_empty() {
            content.push(self.subject.clone());
        }
        if !self.summary.is_empty() {
            content.push(self.summary.clone());
        }
        if !self.episode.is_empty() {
            content.push(self.episode.clone());
        }
        content.extend(self.keywords.iter().cloned());
        content
    }
}

/// Derived per-user-per-group aggregate, version-tagged
///
/// Each upsert writes a new `version`; exactly one row per
/// `(user_id, group_id)` pair has `is_latest = true`, the one with the
/// lexicographically greatest version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProfile {
    pub user_id: String,
    pub group_id: String,
    pub version: String,
    pub is_latest: bool,
    /// Free-form profile payload
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Detail of one participant in a conversation group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDetail {
    pub full_name: String,
    pub role: String,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Group-level conversation metadata, upserted by the chat system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub version: String,
    pub scene: String,
    #[serde(default)]
    pub scene_desc: HashMap<String, serde_json::Value>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub group_id: String,
    pub created_at: DateTime<FixedOffset>,
    pub default_timezone: String,
    #[serde(default)]
    pub user_details: HashMap<String, UserDetail>,
    #[serde(default)]
    pub tags: Vec<String>,
}
