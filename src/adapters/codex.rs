use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use serde_json::Value;
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::adapters::{self, SessionAdapter};
use crate::session::{self, Message, Session};
use crate::util;

/// Reads OpenAI Codex sessions from `~/.codex/sessions/**/rollout-*.jsonl`
/// and `~/.codex/archived_sessions/**/rollout-*.jsonl`. Each line is a typed
/// envelope `{type, timestamp?, payload}`; the project directory is
/// discovered from `session_meta`/`turn_context` entries rather than the
/// file's location.
pub struct CodexAdapter {
    home: PathBuf,
}

/// Everything a single scan of a rollout file can tell us.
#[derive(Debug, Default)]
struct RolloutInfo {
    id: String,
    cwd: String,
    first_user_message: String,
    first_message_at: Option<OffsetDateTime>,
    session_meta_at: Option<OffsetDateTime>,
    user_message_count: u32,
}

impl RolloutInfo {
    fn timestamp(&self) -> Option<OffsetDateTime> {
        self.first_message_at.or(self.session_meta_at)
    }
}

impl CodexAdapter {
    #[must_use]
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    fn session_roots(&self) -> [PathBuf; 2] {
        let codex_home = self.home.join(".codex");
        [
            codex_home.join("sessions"),
            codex_home.join("archived_sessions"),
        ]
    }

    fn rollout_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for root in self.session_roots() {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(&root)
                .follow_links(true)
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|entry| entry.file_type().is_file())
            {
                let name = entry.file_name().to_string_lossy();
                if name.starts_with("rollout-") && name.ends_with(".jsonl") {
                    files.push(entry.into_path());
                }
            }
        }
        files
    }

    fn collect_sessions(&self, target_cwd: Option<&str>) -> Vec<Session> {
        let mut sessions = Vec::new();
        for file in self.rollout_files() {
            let info = match scan_rollout_file(&file) {
                Ok(info) => info,
                Err(err) => {
                    tracing::debug!(path = %file.display(), "skipping unreadable rollout: {err:#}");
                    continue;
                }
            };
            if info.id.is_empty() || info.cwd.is_empty() {
                continue;
            }
            if let Some(target) = target_cwd
                && info.cwd != target
            {
                continue;
            }

            sessions.push(Session {
                id: info.id.clone(),
                source: "codex".to_string(),
                project_path: info.cwd.clone(),
                first_message: info.first_user_message.clone(),
                user_message_count: info.user_message_count,
                timestamp: info.timestamp(),
                file_path: file,
                summary: String::new(),
            });
        }
        sessions
    }

    fn find_rollout_by_id(&self, session_id: &str) -> Option<PathBuf> {
        self.rollout_files().into_iter().find(|file| {
            scan_rollout_file(file)
                .map(|info| info.id == session_id)
                .unwrap_or(false)
        })
    }
}

impl SessionAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn list_sessions(&self, project_path: Option<&str>, limit: usize) -> Result<Vec<Session>> {
        let mut sessions = match project_path.filter(|p| !p.is_empty()) {
            None => self.collect_sessions(None),
            Some(path) => {
                let resolved = adapters::resolve_project_path(path);
                self.collect_sessions(Some(resolved.to_string_lossy().as_ref()))
            }
        };

        adapters::sort_sessions_newest_first(&mut sessions);
        adapters::apply_limit(&mut sessions, limit);
        Ok(sessions)
    }

    fn get_session(&self, session_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>> {
        let file = self
            .find_rollout_by_id(session_id)
            .ok_or_else(|| eyre!("session not found: {session_id}"))?;
        let messages = read_all_messages(&file)?;
        Ok(adapters::paginate(messages, page, page_size))
    }

    fn search_sessions(
        &self,
        project_path: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let sessions = self.list_sessions(project_path, 0)?;
        Ok(adapters::substring_search(sessions, query, limit, |s| {
            read_all_messages(&s.file_path)
        }))
    }
}

/// Scan a rollout file for session metadata. A cheap byte-level check for
/// `"role":"user"` decides between the fast path (metadata only, no user
/// messages present) and the full parse.
fn scan_rollout_file(path: &Path) -> Result<RolloutInfo> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read rollout file {}", path.display()))?;
    let text = String::from_utf8_lossy(&data);

    let mut info = RolloutInfo::default();
    let has_user_messages = text.contains(r#""role":"user""#);

    for line in text.lines() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("session_meta") => {
                let Some(payload) = value.get("payload") else {
                    continue;
                };
                if info.cwd.is_empty()
                    && let Some(cwd) = payload.get("cwd").and_then(Value::as_str)
                {
                    info.cwd = resolve_cwd(cwd);
                }
                if info.id.is_empty()
                    && let Some(id) = payload.get("id").and_then(Value::as_str)
                {
                    info.id = id.to_string();
                }
                if info.session_meta_at.is_none()
                    && let Some(ts) = payload.get("timestamp").and_then(Value::as_str)
                {
                    info.session_meta_at = util::parse_rfc3339(ts);
                }
            }
            Some("turn_context") => {
                if info.cwd.is_empty()
                    && let Some(cwd) = value
                        .get("payload")
                        .and_then(|payload| payload.get("cwd"))
                        .and_then(Value::as_str)
                {
                    info.cwd = resolve_cwd(cwd);
                }
            }
            Some("response_item") if has_user_messages => {
                let Some(payload) = value.get("payload") else {
                    continue;
                };
                if payload.get("type").and_then(Value::as_str) != Some("message")
                    || payload.get("role").and_then(Value::as_str) != Some("user")
                {
                    continue;
                }
                let Some(content) = payload.get("content").and_then(Value::as_array) else {
                    continue;
                };

                let text = extract_user_text(content);
                let trimmed = text.trim();
                if trimmed.is_empty() || session::is_session_prefix(trimmed) {
                    continue;
                }

                info.user_message_count += 1;
                if info.first_user_message.is_empty() {
                    info.first_user_message = session::first_line_preview(&text);
                    info.first_message_at = value
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .and_then(util::parse_rfc3339)
                        .or(info.session_meta_at);
                }
            }
            _ => {}
        }

        // Fast path: nothing left to learn once the metadata is in hand.
        if !has_user_messages && !info.id.is_empty() && !info.cwd.is_empty() {
            break;
        }
    }

    Ok(info)
}

/// Symlink-resolve a recorded working directory so it compares cleanly
/// against resolved project paths; fall back to a component-normalized copy
/// when the directory no longer exists.
fn resolve_cwd(cwd: &str) -> String {
    match fs::canonicalize(cwd) {
        Ok(resolved) => resolved.to_string_lossy().to_string(),
        Err(_) => Path::new(cwd)
            .components()
            .collect::<PathBuf>()
            .to_string_lossy()
            .to_string(),
    }
}

/// User text lives in `input_text` blocks only.
fn extract_user_text(content: &[Value]) -> String {
    content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("input_text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect()
}

/// Assistant text spans every block carrying a `text` field.
fn extract_all_text(content: &[Value]) -> String {
    content
        .iter()
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

fn read_all_messages(path: &Path) -> Result<Vec<Message>> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read rollout file {}", path.display()))?;
    let text = String::from_utf8_lossy(&data);

    let mut messages = Vec::new();
    for line in text.lines() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) != Some("response_item") {
            continue;
        }
        let Some(payload) = value.get("payload") else {
            continue;
        };
        if payload.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(role) = payload.get("role").and_then(Value::as_str) else {
            continue;
        };
        let Some(content) = payload.get("content").and_then(Value::as_array) else {
            continue;
        };

        let mut message = if role == "user" {
            let text = extract_user_text(content);
            if session::is_session_prefix(text.trim()) {
                continue;
            }
            Message::new(role, text)
        } else {
            let mut message = Message::new(role, extract_all_text(content));
            message
                .metadata
                .insert("raw_content".to_string(), Value::Array(content.clone()));
            message
        };
        message.timestamp = value
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(util::parse_rfc3339);
        messages.push(message);
    }

    Ok(messages)
}
