use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::adapters::{self, SessionAdapter};
use crate::session::{self, Message, Session};
use crate::util;

/// Reads Gemini CLI sessions from `~/.gemini/tmp/<h>/chats/session-*.json`,
/// where `h = hex(sha256(absolute project path))`. Each file is one JSON
/// document with a `sessionId`, an optional `startTime`, and an ordered
/// `messages` array.
pub struct GeminiAdapter {
    home: PathBuf,
    /// Project paths recovered per hash directory. Inference is best-effort
    /// and append-only for the process lifetime.
    inferred: Mutex<HashMap<String, Option<String>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiSessionFile {
    session_id: String,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    messages: Vec<GeminiMessage>,
}

#[derive(Debug, Deserialize)]
struct GeminiMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    timestamp: Option<String>,
}

impl GeminiMessage {
    fn normalized_role(&self) -> String {
        let raw = self
            .role
            .as_deref()
            .or(self.kind.as_deref())
            .unwrap_or_default();
        match raw.to_ascii_uppercase().as_str() {
            "USER" => "user".to_string(),
            "ASSISTANT" | "MODEL" | "GEMINI" => "assistant".to_string(),
            _ => raw.to_lowercase(),
        }
    }
}

impl GeminiAdapter {
    #[must_use]
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            inferred: Mutex::new(HashMap::new()),
        }
    }

    fn tmp_dir(&self) -> PathBuf {
        self.home.join(".gemini").join("tmp")
    }

    fn list_all(&self, tmp_dir: &Path) -> Result<Vec<Session>> {
        let entries = match fs::read_dir(tmp_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let hash = entry.file_name().to_string_lossy().to_string();
            let chats_dir = entry.path().join("chats");
            let project_path = self
                .infer_project_path(&hash, &chats_dir)
                .unwrap_or_else(|| format!("unknown-project-{hash}"));
            sessions.extend(list_chats(&chats_dir, &project_path));
        }
        Ok(sessions)
    }

    /// Recover the project path behind a hash directory by scanning one
    /// session document for absolute paths and checking each candidate's
    /// ancestors against the hash. A verified match cannot be a fabrication;
    /// failures are cached so the scan runs once per directory.
    fn infer_project_path(&self, hash: &str, chats_dir: &Path) -> Option<String> {
        {
            let cache = self
                .inferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.get(hash) {
                return cached.clone();
            }
        }

        let inferred = infer_from_chats(hash, chats_dir);
        self.inferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_string(), inferred.clone());
        inferred
    }
}

impl SessionAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn list_sessions(&self, project_path: Option<&str>, limit: usize) -> Result<Vec<Session>> {
        let tmp_dir = self.tmp_dir();
        let mut sessions = match project_path.filter(|p| !p.is_empty()) {
            None => self.list_all(&tmp_dir)?,
            Some(path) => {
                let absolute = std::path::absolute(path)
                    .with_context(|| format!("failed to resolve project path {path}"))?;
                let absolute = absolute.to_string_lossy().to_string();
                let chats_dir = tmp_dir.join(hash_project_path(&absolute)).join("chats");
                list_chats(&chats_dir, &absolute)
            }
        };

        adapters::sort_sessions_newest_first(&mut sessions);
        adapters::apply_limit(&mut sessions, limit);
        Ok(sessions)
    }

    fn get_session(&self, session_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>> {
        // Session ids do not encode their hash directory, so every chats
        // directory has to be probed until the id matches.
        let tmp_dir = self.tmp_dir();
        let entries = fs::read_dir(&tmp_dir)
            .with_context(|| format!("failed to read {}", tmp_dir.display()))?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for path in chat_files(&entry.path().join("chats")) {
                let Some(document) = read_session_file(&path) else {
                    continue;
                };
                if document.session_id == session_id {
                    let messages = document.messages.iter().map(to_message).collect();
                    return Ok(adapters::paginate(messages, page, page_size));
                }
            }
        }

        Err(eyre!("session not found: {session_id}"))
    }

    fn search_sessions(
        &self,
        project_path: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let sessions = self.list_sessions(project_path, 0)?;
        Ok(adapters::substring_search(sessions, query, limit, |s| {
            let document = read_session_file(&s.file_path)
                .ok_or_else(|| eyre!("failed to parse {}", s.file_path.display()))?;
            Ok(document.messages.iter().map(to_message).collect())
        }))
    }
}

fn hash_project_path(path: &str) -> String {
    format!("{:x}", Sha256::digest(path.as_bytes()))
}

fn chat_files(chats_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(chats_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(OsStr::to_str)
                .is_some_and(|name| name.starts_with("session-") && name.ends_with(".json"))
        })
        .collect()
}

fn list_chats(chats_dir: &Path, project_path: &str) -> Vec<Session> {
    let mut sessions = Vec::new();
    for path in chat_files(chats_dir) {
        match parse_session_metadata(&path, project_path) {
            Some(session) => sessions.push(session),
            None => {
                tracing::debug!(path = %path.display(), "skipping unparseable gemini session");
            }
        }
    }
    sessions
}

fn read_session_file(path: &Path) -> Option<GeminiSessionFile> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn parse_session_metadata(path: &Path, project_path: &str) -> Option<Session> {
    let document = read_session_file(path)?;

    // Timestamp precedence: first message -> startTime -> file mtime.
    let timestamp = document
        .messages
        .first()
        .and_then(|message| message.timestamp.as_deref())
        .and_then(util::parse_rfc3339)
        .or_else(|| {
            document
                .start_time
                .as_deref()
                .and_then(util::parse_rfc3339)
        })
        .or_else(|| util::file_mtime(path));

    let mut first_message = String::new();
    let mut user_message_count = 0u32;
    for message in &document.messages {
        if message.normalized_role() != "user" {
            continue;
        }
        user_message_count += 1;
        if first_message.is_empty() {
            first_message = session::first_line_preview(&session::content_to_text(&message.content));
        }
    }

    Some(Session {
        id: document.session_id,
        source: "gemini".to_string(),
        project_path: project_path.to_string(),
        first_message,
        user_message_count,
        timestamp,
        file_path: path.to_path_buf(),
        summary: String::new(),
    })
}

fn to_message(message: &GeminiMessage) -> Message {
    let mut out = Message::new(
        message.normalized_role(),
        session::content_to_text(&message.content),
    );
    out.timestamp = message.timestamp.as_deref().and_then(util::parse_rfc3339);
    out
}

fn infer_from_chats(hash: &str, chats_dir: &Path) -> Option<String> {
    for path in chat_files(chats_dir) {
        let Ok(data) = fs::read(&path) else { continue };
        let Ok(value) = serde_json::from_slice::<Value>(&data) else {
            continue;
        };

        let mut candidates = Vec::new();
        collect_path_candidates(&value, &mut candidates);
        for candidate in candidates {
            for ancestor in Path::new(&candidate).ancestors() {
                let ancestor = ancestor.to_string_lossy();
                if hash_project_path(&ancestor) == hash {
                    return Some(ancestor.to_string());
                }
            }
        }
    }
    None
}

/// Gather absolute-path-looking strings anywhere in the document; tool-call
/// arguments are the usual carriers.
fn collect_path_candidates(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            if text.starts_with('/') && !text.contains('\n') {
                out.push(text.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_path_candidates(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_path_candidates(item, out);
            }
        }
        _ => {}
    }
}
