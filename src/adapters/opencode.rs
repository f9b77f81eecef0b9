use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::adapters::{self, SessionAdapter};
use crate::session::{self, Message, Session};

/// Reads opencode sessions from `~/.local/share/opencode/storage`, a split
/// tree with three parallel subtrees:
///
/// ```text
/// project/<project-id>.json        project metadata (worktree path)
/// session/<project-id>/ses_*.json  session metadata (title, timestamps)
/// message/<session-id>/msg_*.json  one file per message
/// ```
pub struct OpencodeAdapter {
    home: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    worktree: String,
}

#[derive(Debug, Deserialize)]
struct SessionFile {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    time: SessionTime,
}

#[derive(Debug, Default, Deserialize)]
struct SessionTime {
    #[serde(default)]
    created: i64,
}

#[derive(Debug, Deserialize)]
struct MessageFile {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    cost: Option<f64>,
    #[serde(default)]
    tokens: Option<Value>,
    #[serde(default, rename = "modelID")]
    model_id: Option<String>,
    #[serde(default)]
    time: Option<MessageTime>,
}

#[derive(Debug, Deserialize)]
struct MessageTime {
    #[serde(default)]
    created: Option<f64>,
}

impl OpencodeAdapter {
    #[must_use]
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    fn storage_dir(&self) -> PathBuf {
        self.home
            .join(".local")
            .join("share")
            .join("opencode")
            .join("storage")
    }

    /// Find the project whose worktree equals the resolved target path.
    fn find_project_id(&self, storage: &Path, target: &str) -> Option<String> {
        let entries = fs::read_dir(storage.join("project")).ok()?;
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if path.extension().and_then(OsStr::to_str) != Some("json") {
                continue;
            }
            let Some(project) = read_json::<ProjectFile>(&path) else {
                continue;
            };
            if project.worktree == target {
                return path
                    .file_stem()
                    .and_then(OsStr::to_str)
                    .map(str::to_string);
            }
        }
        None
    }

    fn list_project_sessions(&self, storage: &Path, project_id: &str, worktree: &str) -> Vec<Session> {
        let session_dir = storage.join("session").join(project_id);
        let Ok(entries) = fs::read_dir(&session_dir) else {
            return Vec::new();
        };

        let mut sessions = Vec::new();
        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(OsStr::to_str) else {
                continue;
            };
            if !name.starts_with("ses_") || !name.ends_with(".json") {
                continue;
            }
            let Some(document) = read_json::<SessionFile>(&path) else {
                tracing::debug!(path = %path.display(), "skipping unparseable opencode session");
                continue;
            };

            let first_message = self
                .first_user_message(storage, &document.id)
                .unwrap_or_default();

            sessions.push(Session {
                id: document.id,
                source: "opencode".to_string(),
                project_path: worktree.to_string(),
                first_message,
                user_message_count: 0,
                timestamp: millis_to_timestamp(document.time.created),
                file_path: path,
                summary: document.title,
            });
        }
        sessions
    }

    fn first_user_message(&self, storage: &Path, session_id: &str) -> Option<String> {
        for path in message_files(storage, session_id) {
            let Some(message) = read_json::<MessageFile>(&path) else {
                continue;
            };
            if message.role != "user" {
                continue;
            }
            let content = session::content_to_text(&message.content);
            if !content.is_empty() {
                return Some(session::first_line_preview(&content));
            }
        }
        None
    }
}

impl SessionAdapter for OpencodeAdapter {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn list_sessions(&self, project_path: Option<&str>, limit: usize) -> Result<Vec<Session>> {
        let storage = self.storage_dir();
        if !storage.is_dir() {
            return Ok(Vec::new());
        }

        let target_project_id = match project_path.filter(|p| !p.is_empty()) {
            None => None,
            Some(path) => {
                let resolved = adapters::resolve_project_path(path);
                match self.find_project_id(&storage, resolved.to_string_lossy().as_ref()) {
                    Some(id) => Some(id),
                    None => return Ok(Vec::new()),
                }
            }
        };

        let session_root = storage.join("session");
        let entries = fs::read_dir(&session_root)
            .with_context(|| format!("failed to read {}", session_root.display()))?;

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let project_id = entry.file_name().to_string_lossy().to_string();
            if let Some(target) = &target_project_id
                && &project_id != target
            {
                continue;
            }
            let Some(project) =
                read_json::<ProjectFile>(&storage.join("project").join(format!("{project_id}.json")))
            else {
                continue;
            };
            sessions.extend(self.list_project_sessions(&storage, &project_id, &project.worktree));
        }

        adapters::sort_sessions_newest_first(&mut sessions);
        adapters::apply_limit(&mut sessions, limit);
        Ok(sessions)
    }

    fn get_session(&self, session_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>> {
        let storage = self.storage_dir();
        let message_dir = storage.join("message").join(session_id);
        if !message_dir.is_dir() {
            return Err(eyre!("session not found: {session_id}"));
        }

        let mut messages = Vec::new();
        for path in message_files(&storage, session_id) {
            let Some(document) = read_json::<MessageFile>(&path) else {
                continue;
            };
            messages.push(to_message(document));
        }
        Ok(adapters::paginate(messages, page, page_size))
    }

    fn search_sessions(
        &self,
        project_path: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let sessions = self.list_sessions(project_path, 0)?;
        let storage = self.storage_dir();
        Ok(adapters::substring_search(sessions, query, limit, |s| {
            Ok(message_files(&storage, &s.id)
                .into_iter()
                .filter_map(|path| read_json::<MessageFile>(&path))
                .map(to_message)
                .collect())
        }))
    }
}

/// Message files for a session in lexicographic filename order. The ids are
/// assumed to sort chronologically; no timestamp is invented when they do
/// not.
fn message_files(storage: &Path, session_id: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(storage.join("message").join(session_id)) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(OsStr::to_str)
                .is_some_and(|name| name.starts_with("msg_") && name.ends_with(".json"))
        })
        .collect();
    files.sort();
    files
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn to_message(document: MessageFile) -> Message {
    let mut message = Message::new(
        document.role,
        session::content_to_text(&document.content),
    );
    message.timestamp = document
        .time
        .and_then(|time| time.created)
        .and_then(|millis| millis_to_timestamp(millis as i64));

    if let Some(model) = document.model_id {
        message.metadata.insert("model".to_string(), json!(model));
    }
    if let Some(mode) = document.mode {
        message.metadata.insert("mode".to_string(), json!(mode));
    }
    if let Some(cost) = document.cost
        && cost > 0.0
    {
        message.metadata.insert("cost".to_string(), json!(cost));
    }
    if let Some(tokens) = document.tokens {
        message.metadata.insert("tokens".to_string(), tokens);
    }
    message
}

fn millis_to_timestamp(millis: i64) -> Option<OffsetDateTime> {
    if millis == 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}
