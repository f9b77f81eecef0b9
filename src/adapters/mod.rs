pub mod claude;
pub mod codex;
pub mod gemini;
pub mod opencode;

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::Result;

use crate::session::{Message, Session};

/// Uniform read-only contract over one assistant's on-disk session layout.
///
/// Adapters never create or mutate source files; they normalize whatever is
/// on disk into [`Session`] and [`Message`] values.
pub trait SessionAdapter: Send + Sync {
    /// Short source tag ("claude", "gemini", "codex", "opencode").
    fn name(&self) -> &'static str;

    /// List sessions, newest first. A missing or empty `project_path` means
    /// all projects; `limit == 0` means no cap.
    ///
    /// # Errors
    ///
    /// Returns an error when the source tree cannot be enumerated.
    fn list_sessions(&self, project_path: Option<&str>, limit: usize) -> Result<Vec<Session>>;

    /// Fetch one page of a session's messages. Pages are 0-indexed
    /// whole-message slices; out-of-range pages yield an empty list.
    ///
    /// # Errors
    ///
    /// Fails when no artifact carries `session_id`, or on read failures.
    fn get_session(&self, session_id: &str, page: usize, page_size: usize) -> Result<Vec<Message>>;

    /// Naive substring search across session content. The dispatcher's
    /// search path prefers the index store; this keeps each adapter
    /// self-sufficient.
    ///
    /// # Errors
    ///
    /// Returns an error when listing fails.
    fn search_sessions(
        &self,
        project_path: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Session>>;
}

/// All adapters known to this build, rooted at the user's home directory.
#[must_use]
pub fn default_adapters(home: &Path) -> Vec<Arc<dyn SessionAdapter>> {
    vec![
        Arc::new(claude::ClaudeAdapter::new(home.to_path_buf())),
        Arc::new(gemini::GeminiAdapter::new(home.to_path_buf())),
        Arc::new(codex::CodexAdapter::new(home.to_path_buf())),
        Arc::new(opencode::OpencodeAdapter::new(home.to_path_buf())),
    ]
}

/// Newest first; sessions without a timestamp sort last; ties fall back to
/// the first message so repeated listings stay deterministic.
pub fn sort_sessions_newest_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(lhs), Some(rhs)) => rhs
            .cmp(&lhs)
            .then_with(|| b.first_message.cmp(&a.first_message)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.first_message.cmp(&a.first_message),
    });
}

pub(crate) fn apply_limit(sessions: &mut Vec<Session>, limit: usize) {
    if limit > 0 && sessions.len() > limit {
        sessions.truncate(limit);
    }
}

/// Slice one 0-indexed page out of a full transcript.
pub(crate) fn paginate(messages: Vec<Message>, page: usize, page_size: usize) -> Vec<Message> {
    let start = page.saturating_mul(page_size);
    if start >= messages.len() {
        return Vec::new();
    }
    messages.into_iter().skip(start).take(page_size).collect()
}

/// Shared substring matcher behind each adapter's `search_sessions`: match
/// on summary or first message first, then fall back to scanning the full
/// transcript via `read_messages`.
pub(crate) fn substring_search<F>(
    sessions: Vec<Session>,
    query: &str,
    limit: usize,
    read_messages: F,
) -> Vec<Session>
where
    F: Fn(&Session) -> Result<Vec<Message>>,
{
    let query = query.to_lowercase();
    let mut matches = Vec::new();

    for session in sessions {
        if limit > 0 && matches.len() >= limit {
            break;
        }
        if session.summary.to_lowercase().contains(&query)
            || session.first_message.to_lowercase().contains(&query)
        {
            matches.push(session);
            continue;
        }
        match read_messages(&session) {
            Ok(messages) => {
                if messages
                    .iter()
                    .any(|message| message.content.to_lowercase().contains(&query))
                {
                    matches.push(session);
                }
            }
            Err(err) => {
                tracing::debug!(session = %session.id, "skipping unreadable session during search: {err:#}");
            }
        }
    }

    matches
}

/// Absolute, symlink-resolved form of a requested project path. Resolution
/// falls back to the absolute form when the path does not exist.
pub(crate) fn resolve_project_path(path: &str) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| PathBuf::from(path));
    absolute.canonicalize().unwrap_or(absolute)
}
