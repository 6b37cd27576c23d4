//! Inbound message types
//!
//! A `RawMessage` is the atomic unit delivered to the memorize pipeline. It
//! is immutable once delivered; the pipeline buffers it, and the extractor
//! carries it verbatim into the persisted record's `original_data`.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    /// One-on-one assistant conversation
    #[default]
    Assistant,
    /// Multi-party group chat
    GroupChat,
}

impl Scene {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::GroupChat => "group_chat",
        }
    }
}

/// One inbound chat message
///
/// `group_id` may be empty for private chats; routing then falls back to
/// `sender_id`. Timestamps always carry an explicit offset — naive inputs
/// are rejected at the API boundary, never silently localized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub group_name: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<FixedOffset>,
    /// Message ids this one quotes, in quote order
    #[serde(default)]
    pub refer_list: Vec<String>,
    #[serde(default)]
    pub scene: Scene,
}

impl RawMessage {
    /// Key used to route and buffer this message: the group for group chats,
    /// the sender for private ones.
    pub fn routing_key(&self) -> &str {
        if self.group_id.is_empty() {
            &self.sender_id
        } else {
            &self.group_id
        }
    }

    /// Epoch milliseconds of the message timestamp, the score used in the
    /// buffer queue.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// A closed conversation segment handed to the extractors
///
/// `history` holds the context buffered before the boundary fired and `new`
/// the messages that triggered it. Both are ordered by arrival.
#[derive(Debug, Clone)]
pub struct EpisodeSegment {
    pub history: Vec<RawMessage>,
    pub new: Vec<RawMessage>,
    pub group_id: String,
    pub current_time: DateTime<FixedOffset>,
}

impl EpisodeSegment {
    /// All messages of the segment in order
    pub fn messages(&self) -> impl Iterator<Item = &RawMessage> {
        self.history.iter().chain(self.new.iter())
    }

    /// Number of messages across history and new
    pub fn len(&self) -> usize {
        self.history.len() + self.new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.new.is_empty()
    }

    /// Distinct sender ids, ordered
    pub fn participants(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.messages().map(|m| m.sender_id.as_str()).collect();
        set.into_iter().map(String::from).collect()
    }

    /// Timestamp of the first message; the MemCell inherits it
    pub fn first_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.messages().next().map(|m| m.timestamp)
    }
}
