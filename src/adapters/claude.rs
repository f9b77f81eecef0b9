use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use regex::Regex;
use serde_json::Value;

use crate::adapters::{self, SessionAdapter};
use crate::session::{self, Message, Session};
use crate::util;

/// Marker blocks injected by the editor integration; they carry no user
/// intent and must not leak into list previews.
static MARKER_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<ide_opened_file>.*?</ide_opened_file>|<local-command-stdout>.*?</local-command-stdout>",
    )
    .expect("marker block pattern")
});

/// Reads Claude Code transcripts from `~/.claude/projects/<dir>/<id>.jsonl`,
/// where `<dir>` is the absolute project path with every `/` replaced by `-`.
/// Each line is a JSON envelope with a `type` field (`summary`, `user`,
/// `assistant`, ...).
pub struct ClaudeAdapter {
    home: PathBuf,
}

impl ClaudeAdapter {
    #[must_use]
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    fn projects_dir(&self) -> PathBuf {
        self.home.join(".claude").join("projects")
    }

    fn list_all(&self, projects_dir: &Path) -> Result<Vec<Session>> {
        let entries = match fs::read_dir(projects_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let project_path = project_path_from_dir(&entry.file_name().to_string_lossy());
            sessions.extend(self.list_project(&entry.path(), &project_path)?);
        }
        Ok(sessions)
    }

    fn list_project(&self, dir: &Path, project_path: &str) -> Result<Vec<Session>> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read project directory {}", dir.display()))?;

        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(OsStr::to_str) != Some("jsonl") {
                continue;
            }
            match parse_session_metadata(&path, project_path) {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    tracing::debug!(path = %path.display(), "skipping unparseable session: {err:#}");
                }
            }
        }
        Ok(sessions)
    }
}

impl SessionAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn list_sessions(&self, project_path: Option<&str>, limit: usize) -> Result<Vec<Session>> {
        let projects_dir = self.projects_dir();
        let mut sessions = match project_path.filter(|p| !p.is_empty()) {
            None => self.list_all(&projects_dir)?,
            Some(path) => {
                let absolute = std::path::absolute(path)
                    .with_context(|| format!("failed to resolve project path {path}"))?;
                let dir = projects_dir.join(project_dir_name(&absolute));
                if dir.is_dir() {
                    self.list_project(&dir, &absolute.to_string_lossy())?
                } else {
                    Vec::new()
                }
            }
        };

        adapters::sort_sessions_newest_first(&mut sessions);
        adapters::apply_limit(&mut sessions, limit);
        Ok(sessions)
    }

    fn get_session(&self, session_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>> {
        let projects_dir = self.projects_dir();
        let entries = fs::read_dir(&projects_dir)
            .with_context(|| format!("failed to read {}", projects_dir.display()))?;

        let mut session_file = None;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let candidate = entry.path().join(format!("{session_id}.jsonl"));
            if candidate.is_file() {
                session_file = Some(candidate);
                break;
            }
        }

        let session_file =
            session_file.ok_or_else(|| eyre!("session not found: {session_id}"))?;
        let messages = read_all_messages(&session_file)?;
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

/// Forward mapping from a project path to Claude's directory naming.
fn project_dir_name(project_path: &Path) -> String {
    project_path.to_string_lossy().replace('/', "-")
}

/// Inverse mapping. Lossy by construction: a project path containing a
/// literal `-` comes back corrupted and the leading slash is dropped. This
/// matches the layout's established decoding and is kept as-is.
fn project_path_from_dir(dir_name: &str) -> String {
    dir_name.replace('-', "/").trim_start_matches('/').to_string()
}

/// Extract list metadata from a session file without loading it whole:
/// the first `summary` envelope and the first `user` envelope are enough.
fn parse_session_metadata(path: &Path, project_path: &str) -> Result<Session> {
    let file = File::open(path)
        .with_context(|| format!("failed to open session file {}", path.display()))?;
    let reader = BufReader::new(file);

    let id = path
        .file_stem()
        .and_then(OsStr::to_str)
        .ok_or_else(|| eyre!("session file has no usable name: {}", path.display()))?
        .to_string();

    let mut session = Session {
        id,
        source: "claude".to_string(),
        project_path: project_path.to_string(),
        first_message: String::new(),
        user_message_count: 0,
        timestamp: util::file_mtime(path),
        file_path: path.to_path_buf(),
        summary: String::new(),
    };

    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("summary") => {
                if session.summary.is_empty()
                    && let Some(summary) = value.get("summary").and_then(Value::as_str)
                    && !summary.is_empty()
                {
                    session.summary = summary.to_string();
                }
            }
            Some("user") => {
                session.first_message = first_user_preview(&value);
                break;
            }
            _ => {}
        }
    }

    Ok(session)
}

fn first_user_preview(value: &Value) -> String {
    let Some(content) = value.get("content") else {
        return String::new();
    };
    let text = session::content_to_text(content);
    let stripped = MARKER_BLOCKS.replace_all(&text, "");
    session::first_line_preview(&stripped)
}

/// Read the full transcript, keeping only `user` and `assistant` envelopes.
/// Malformed lines are skipped. Lines can be large (multi-MiB tool output).
fn read_all_messages(path: &Path) -> Result<Vec<Message>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open session file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut messages = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            continue;
        };
        if kind != "user" && kind != "assistant" {
            continue;
        }

        let content = value.get("content").cloned().unwrap_or(Value::Null);
        let mut message = Message::new(kind, session::content_to_text(&content));
        if kind == "assistant" {
            // Keep tool calls and thinking blocks available to callers.
            message.metadata.insert("raw_content".to_string(), content);
        }
        messages.push(message);
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;

    fn write_session(temp: &TempDir, project_dir: &str, name: &str, lines: &str) {
        let file = temp.child(format!(".claude/projects/{project_dir}/{name}.jsonl"));
        file.write_str(lines).expect("write session fixture");
    }

    #[test]
    fn directory_name_round_trip_keeps_the_documented_quirk() {
        let dir = project_dir_name(Path::new("/Users/dev/project"));
        assert_eq!(dir, "-Users-dev-project");
        assert_eq!(project_path_from_dir(&dir), "Users/dev/project");
    }

    #[test]
    fn lists_sessions_with_summary_and_first_message() -> Result<()> {
        let temp = TempDir::new()?;
        write_session(
            &temp,
            "-work-demo",
            "11111111-aaaa-bbbb-cccc-222222222222",
            concat!(
                "{\"type\":\"summary\",\"summary\":\"Refactoring session\"}\n",
                "not json at all\n",
                "{\"type\":\"user\",\"content\":\"\\nFix the flaky test\\nplease\"}\n",
                "{\"type\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"On it\"}]}\n",
            ),
        );

        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        let sessions = adapter.list_sessions(None, 0)?;

        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.id, "11111111-aaaa-bbbb-cccc-222222222222");
        assert_eq!(session.source, "claude");
        assert_eq!(session.project_path, "work/demo");
        assert_eq!(session.summary, "Refactoring session");
        assert_eq!(session.first_message, "Fix the flaky test");
        assert!(session.timestamp.is_some(), "mtime fallback expected");
        temp.close()?;
        Ok(())
    }

    #[test]
    fn strips_marker_blocks_from_the_preview() -> Result<()> {
        let temp = TempDir::new()?;
        write_session(
            &temp,
            "-work-demo",
            "session-a",
            "{\"type\":\"user\",\"content\":\"<ide_opened_file>src/lib.rs</ide_opened_file>\\n<local-command-stdout>ok</local-command-stdout>\\nActual question here\"}\n",
        );

        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        let sessions = adapter.list_sessions(None, 0)?;
        assert_eq!(sessions[0].first_message, "Actual question here");
        temp.close()?;
        Ok(())
    }

    #[test]
    fn project_scoped_listing_uses_the_forward_mapping() -> Result<()> {
        let temp = TempDir::new()?;
        let project = temp.child("work/demo");
        project.create_dir_all()?;
        let project_path = std::path::absolute(project.path())?;
        let dir_name = project_dir_name(&project_path);
        write_session(
            &temp,
            &dir_name,
            "session-a",
            "{\"type\":\"user\",\"content\":\"hello there\"}\n",
        );

        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        let sessions =
            adapter.list_sessions(Some(project_path.to_string_lossy().as_ref()), 0)?;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].project_path, project_path.to_string_lossy());

        let none = adapter.list_sessions(Some("/no/such/project"), 0)?;
        assert!(none.is_empty());
        temp.close()?;
        Ok(())
    }

    #[test]
    fn get_session_pages_and_preserves_raw_assistant_content() -> Result<()> {
        let temp = TempDir::new()?;
        write_session(
            &temp,
            "-work-demo",
            "paged",
            concat!(
                "{\"type\":\"user\",\"content\":\"first\"}\n",
                "{\"type\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"reply\"}]}\n",
                "{\"type\":\"system\",\"content\":\"hidden\"}\n",
                "{\"type\":\"user\",\"content\":\"second\"}\n",
            ),
        );

        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        let first_page = adapter.get_session("paged", 0, 2)?;
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].role, "user");
        assert_eq!(first_page[1].role, "assistant");
        assert!(first_page[1].metadata.contains_key("raw_content"));

        let second_page = adapter.get_session("paged", 1, 2)?;
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].content, "second");

        let beyond = adapter.get_session("paged", 9, 2)?;
        assert!(beyond.is_empty());
        temp.close()?;
        Ok(())
    }

    #[test]
    fn get_session_fails_for_unknown_ids() -> Result<()> {
        let temp = TempDir::new()?;
        write_session(&temp, "-work-demo", "known", "{\"type\":\"user\",\"content\":\"hi\"}\n");
        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        let err = adapter.get_session("unknown", 0, 10).unwrap_err();
        assert!(format!("{err}").contains("session not found"));
        temp.close()?;
        Ok(())
    }

    #[test]
    fn search_matches_summary_and_content() -> Result<()> {
        let temp = TempDir::new()?;
        write_session(
            &temp,
            "-work-demo",
            "by-summary",
            concat!(
                "{\"type\":\"summary\",\"summary\":\"database migration\"}\n",
                "{\"type\":\"user\",\"content\":\"do the thing\"}\n",
            ),
        );
        write_session(
            &temp,
            "-work-demo",
            "by-content",
            concat!(
                "{\"type\":\"user\",\"content\":\"something else\"}\n",
                "{\"type\":\"assistant\",\"content\":\"the migration is done\"}\n",
            ),
        );
        write_session(
            &temp,
            "-work-demo",
            "no-match",
            "{\"type\":\"user\",\"content\":\"unrelated\"}\n",
        );

        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        let matches = adapter.search_sessions(None, "migration", 0)?;
        let mut ids: Vec<&str> = matches.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["by-content", "by-summary"]);
        temp.close()?;
        Ok(())
    }

    #[test]
    fn summary_only_sessions_keep_an_empty_preview() -> Result<()> {
        let temp = TempDir::new()?;
        write_session(
            &temp,
            "-work-demo",
            "summary-only",
            "{\"type\":\"summary\",\"summary\":\"Abandoned early\"}\n",
        );

        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        let sessions = adapter.list_sessions(None, 0)?;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].summary, "Abandoned early");
        assert!(sessions[0].first_message.is_empty());
        assert_eq!(sessions[0].user_message_count, 0);
        temp.close()?;
        Ok(())
    }

    #[test]
    fn missing_projects_directory_yields_no_sessions() -> Result<()> {
        let temp = TempDir::new()?;
        let adapter = ClaudeAdapter::new(temp.path().to_path_buf());
        assert!(adapter.list_sessions(None, 0)?.is_empty());
        temp.close()?;
        Ok(())
    }
}
