//! Prompt templates for the extraction LLM calls
//!
//! Every prompt ends with an explicit JSON schema and a "JSON only" rule.
//! The parsers slice the first `{`..`}` span, so stray prose around the
//! object does not break them.

use chatmem_core::{EpisodeSegment, MemoryRecord, RawMessage};
use chrono::{DateTime, FixedOffset};

/// Render messages as a numbered transcript, 1-based to match cut indices
pub fn render_transcript(messages: &[&RawMessage]) -> String {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let sender = m.sender_name.as_deref().unwrap_or(&m.sender_id);
            format!(
                "{}. [{}] {}: {}",
                i + 1,
                m.timestamp.format("%Y-%m-%d %H:%M:%S%:z"),
                sender,
                m.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Boundary-decision prompt: has the conversation reached a natural close?
pub fn boundary_prompt(
    history: &[RawMessage],
    new: &[RawMessage],
    current_time: DateTime<FixedOffset>,
) -> String {
    let all: Vec<&RawMessage> = history.iter().chain(new.iter()).collect();
    let transcript = render_transcript(&all);
    let total = all.len();
    let new_from = total - new.len() + 1;

    format!(
        r#"You are segmenting a chat stream into coherent episodes.

Current time: {current_time}
Messages {new_from} through {total} arrived after the last check.

Conversation so far:
{transcript}

Decide whether the conversation has reached a natural end. Emit a boundary
only when you see a clear close: the topic concluded, an explicit farewell,
a long silence before the newest message, or an obvious switch to an
unrelated topic. If the discussion is still in progress, wait for more.

Respond with JSON only:
{{
    "boundary": true/false,
    "cut_index": <number of leading messages that form the closed episode, 1-{total}; 0 when boundary is false>,
    "reason": "<one short sentence>"
}}"#,
    )
}

/// MemCell extraction prompt over a closed segment
pub fn memcell_prompt(segment: &EpisodeSegment) -> String {
    let all: Vec<&RawMessage> = segment.messages().collect();
    let transcript = render_transcript(&all);

    format!(
        r#"Summarize this closed conversation segment into one memory record.

Conversation:
{transcript}

Write the subject and summary in the language the conversation uses.
Keep the subject under 15 words. The summary is one paragraph covering who
said what, decisions made, and any facts worth remembering. Keywords are
the terms someone would later search for. Entities are the named people,
places, products, or organizations the conversation mentions.

Respond with JSON only:
{{
    "subject": "<short title>",
    "summary": "<one paragraph>",
    "keywords": ["<keyword>", ...],
    "entities": ["<entity>", ...]
}}"#,
    )
}

/// Episode derivation prompt over a batch of MemCells
pub fn episode_prompt(cells: &[MemoryRecord]) -> String {
    let cell_list = cells
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. [{}] {} — {}",
                i + 1,
                c.timestamp.format("%Y-%m-%d %H:%M"),
                c.subject,
                c.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"The following memory records belong to one conversation group and
form a narrative arc. Derive a single episode summary over all of them.

Records:
{cell_list}

The episode is a flowing narrative (a few sentences) that ties the records
together in chronological order. Search phrases are standalone queries a
user might type to find this episode later.

Respond with JSON only:
{{
    "title": "<episode title>",
    "summary": "<one-paragraph digest>",
    "episode": "<narrative>",
    "search_phrases": ["<phrase>", ...]
}}"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmem_core::Scene;
    use chrono::TimeZone;

    fn msg(id: &str, content: &str, minute: u32) -> RawMessage {
        RawMessage {
            message_id: id.into(),
            group_id: "g1".into(),
            group_name: String::new(),
            sender_id: "alice".into(),
            sender_name: Some("Alice".into()),
            content: content.into(),
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 6, 1, 9, minute, 0)
                .unwrap(),
            refer_list: Vec::new(),
            scene: Scene::GroupChat,
        }
    }

    #[test]
    fn test_transcript_is_one_based() {
        let m1 = msg("m1", "hi", 0);
        let m2 = msg("m2", "bye", 1);
        let transcript = render_transcript(&[&m1, &m2]);
        assert!(transcript.starts_with("1. ["));
        assert!(transcript.contains("2. ["));
        assert!(transcript.contains("Alice: bye"));
    }

    #[test]
    fn test_boundary_prompt_marks_new_range() {
        let history = vec![msg("m1", "a", 0), msg("m2", "b", 1)];
        let new = vec![msg("m3", "c", 2)];
        let prompt = boundary_prompt(&history, &new, new[0].timestamp);
        assert!(prompt.contains("Messages 3 through 3"));
        assert!(prompt.contains("\"boundary\""));
    }
}
