use std::path::PathBuf;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Byte cap applied to list previews of the first user message.
pub const FIRST_MESSAGE_PREVIEW_BYTES: usize = 200;

/// Normalized view of one assistant conversation, regardless of which CLI
/// assistant wrote it to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique within its source; format varies per assistant.
    pub id: String,
    /// Source adapter tag ("claude", "gemini", "codex", "opencode").
    pub source: String,
    /// Project directory the session pertains to; empty when unknown.
    pub project_path: String,
    /// First non-empty line of the first user-authored message.
    pub first_message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub user_message_count: u32,
    /// Instant the session started, best available.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    /// Canonical on-disk artifact backing the session; its mtime governs
    /// index freshness.
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

/// One message within a session, flattened to plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
    /// Source-specific annotations: model id, token counts, raw structured
    /// content for assistant turns.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: None,
            metadata: Map::new(),
        }
    }
}

fn is_zero(count: &u32) -> bool {
    *count == 0
}

/// Flatten a transcript content value into plain text. Assistants store
/// content as a plain string, an ordered list of typed blocks carrying `text`
/// fields, or a map with a `text` key.
#[must_use]
pub fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .join("\n"),
        Value::Object(map) => match map.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => Value::Object(map.clone()).to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// First non-empty line of `text`, trimmed and capped for list previews.
#[must_use]
pub fn first_line_preview(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(truncate_preview)
        .unwrap_or_default()
}

fn truncate_preview(line: &str) -> String {
    if line.len() <= FIRST_MESSAGE_PREVIEW_BYTES {
        return line.to_string();
    }
    let mut cut = FIRST_MESSAGE_PREVIEW_BYTES;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &line[..cut])
}

const SESSION_PREFIX_MARKERS: [(&str, &str); 2] = [
    ("<user_instructions>", "</user_instructions>"),
    ("<environment_context>", "</environment_context>"),
];

/// True when `trimmed` is assistant-injected boilerplate enclosed in one of
/// the session prefix marker pairs. Such messages never count as user input.
#[must_use]
pub fn is_session_prefix(trimmed: &str) -> bool {
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    SESSION_PREFIX_MARKERS
        .iter()
        .any(|(open, close)| lower.starts_with(open) && lower.ends_with(close))
}
