use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use color_eyre::eyre;
use tokio_util::sync::CancellationToken;

use crate::adapters::SessionAdapter;
use crate::search::store::SearchStore;
use crate::session::Session;

/// Outcome of one lazy indexing pass.
#[derive(Debug, Default)]
pub struct IndexReport {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub errors: Vec<IndexError>,
}

#[derive(Debug)]
pub struct IndexError {
    pub session_id: String,
    pub error: eyre::Report,
}

/// Bring the index up to date for every session the selected adapters can
/// currently see under the given project filter.
///
/// Sessions whose backing file mtime has not advanced since the last pass
/// are skipped. Per-session failures are recorded and the loop continues;
/// cancellation is honored between sessions and leaves already-committed
/// work in place.
pub fn refresh_index(
    store: &Mutex<SearchStore>,
    adapters: &[Arc<dyn SessionAdapter>],
    project_path: Option<&str>,
    cancel: &CancellationToken,
) -> IndexReport {
    let mut report = IndexReport::default();

    for adapter in adapters {
        if cancel.is_cancelled() {
            break;
        }
        let sessions = match adapter.list_sessions(project_path, 0) {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(
                    source = adapter.name(),
                    "failed to list sessions for indexing: {err:#}"
                );
                continue;
            }
        };

        for session in sessions {
            if cancel.is_cancelled() {
                tracing::debug!("indexing cancelled, keeping committed progress");
                return report;
            }
            report.scanned += 1;
            match index_one(store, adapter.as_ref(), &session) {
                Ok(true) => report.indexed += 1,
                Ok(false) => report.skipped += 1,
                Err(error) => {
                    tracing::warn!(
                        source = adapter.name(),
                        session = %session.id,
                        "failed to index session: {error:#}"
                    );
                    report.errors.push(IndexError {
                        session_id: session.id,
                        error,
                    });
                }
            }
        }
    }

    report
}

fn index_one(
    store: &Mutex<SearchStore>,
    adapter: &dyn SessionAdapter,
    session: &Session,
) -> eyre::Result<bool> {
    if !lock(store).needs_reindex(&session.id, &session.file_path)? {
        return Ok(false);
    }

    let messages = adapter.get_session(&session.id, 0, usize::MAX)?;
    let mut content = String::new();
    content.push_str(&session.first_message);
    content.push(' ');
    content.push_str(&session.summary);
    for message in &messages {
        content.push(' ');
        content.push_str(&message.content);
    }

    lock(store).index_session(session, &content)?;
    Ok(true)
}

fn lock(store: &Mutex<SearchStore>) -> MutexGuard<'_, SearchStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use color_eyre::Result;
    use color_eyre::eyre::eyre;
    use time::OffsetDateTime;

    use crate::session::Message;

    struct FixedAdapter {
        sessions: Vec<Session>,
        fetches: AtomicUsize,
    }

    impl SessionAdapter for FixedAdapter {
        fn name(&self) -> &'static str {
            "codex"
        }

        fn list_sessions(&self, _project_path: Option<&str>, _limit: usize) -> Result<Vec<Session>> {
            Ok(self.sessions.clone())
        }

        fn get_session(
            &self,
            session_id: &str,
            _page: usize,
            _page_size: usize,
        ) -> Result<Vec<Message>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if session_id == "unfetchable" {
                return Err(eyre!("session not found: {session_id}"));
            }
            Ok(vec![Message::new("user", format!("{session_id} body"))])
        }

        fn search_sessions(
            &self,
            _project_path: Option<&str>,
            _query: &str,
            _limit: usize,
        ) -> Result<Vec<Session>> {
            Ok(Vec::new())
        }
    }

    fn session_backed_by(id: &str, file_path: PathBuf) -> Session {
        Session {
            id: id.to_string(),
            source: "codex".to_string(),
            project_path: "/workspace".to_string(),
            first_message: format!("{id} prompt"),
            user_message_count: 1,
            timestamp: Some(OffsetDateTime::from_unix_timestamp(1_720_000_000).expect("ts")),
            file_path,
            summary: String::new(),
        }
    }

    fn store_in(temp: &TempDir) -> Result<Mutex<SearchStore>> {
        Ok(Mutex::new(SearchStore::open(
            temp.child("search.db").path(),
        )?))
    }

    #[test]
    fn second_pass_skips_everything_fresh() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.child("session.jsonl");
        file.write_str("raw")?;
        let store = store_in(&temp)?;
        let adapter: Arc<dyn SessionAdapter> = Arc::new(FixedAdapter {
            sessions: vec![session_backed_by("sess-1", file.path().to_path_buf())],
            fetches: AtomicUsize::new(0),
        });

        let report = refresh_index(&store, &[Arc::clone(&adapter)], None, &CancellationToken::new());
        assert_eq!(report.scanned, 1);
        assert_eq!(report.indexed, 1);
        assert_eq!(report.skipped, 0);
        assert!(report.errors.is_empty());

        let report = refresh_index(&store, &[adapter], None, &CancellationToken::new());
        assert_eq!(report.indexed, 0);
        assert_eq!(report.skipped, 1);
        temp.close()?;
        Ok(())
    }

    #[test]
    fn failures_are_collected_and_do_not_stop_the_pass() -> Result<()> {
        let temp = TempDir::new()?;
        let good = temp.child("good.jsonl");
        good.write_str("raw")?;
        let store = store_in(&temp)?;
        let adapter: Arc<dyn SessionAdapter> = Arc::new(FixedAdapter {
            sessions: vec![
                session_backed_by("unfetchable", good.path().to_path_buf()),
                session_backed_by("sess-ok", good.path().to_path_buf()),
            ],
            fetches: AtomicUsize::new(0),
        });

        let report = refresh_index(&store, &[adapter], None, &CancellationToken::new());
        assert_eq!(report.scanned, 2);
        assert_eq!(report.indexed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].session_id, "unfetchable");

        let hits = lock(&store).search("body", None, None, 0)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session.id, "sess-ok");
        temp.close()?;
        Ok(())
    }

    #[test]
    fn cancellation_stops_between_sessions_and_keeps_progress() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.child("session.jsonl");
        file.write_str("raw")?;
        let store = store_in(&temp)?;
        let adapter: Arc<dyn SessionAdapter> = Arc::new(FixedAdapter {
            sessions: vec![session_backed_by("sess-1", file.path().to_path_buf())],
            fetches: AtomicUsize::new(0),
        });

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let report = refresh_index(&store, &[adapter], None, &cancelled);
        assert_eq!(report.scanned, 0, "cancelled pass must not touch sessions");
        temp.close()?;
        Ok(())
    }

    #[test]
    fn indexed_content_includes_preview_summary_and_messages() -> Result<()> {
        let temp = TempDir::new()?;
        let file = temp.child("session.jsonl");
        file.write_str("raw")?;
        let store = store_in(&temp)?;

        let mut session = session_backed_by("sess-1", file.path().to_path_buf());
        session.summary = "weekly planning".to_string();
        let adapter: Arc<dyn SessionAdapter> = Arc::new(FixedAdapter {
            sessions: vec![session],
            fetches: AtomicUsize::new(0),
        });
        refresh_index(&store, &[adapter], None, &CancellationToken::new());

        // All three content sources are searchable.
        for term in ["prompt", "planning", "body"] {
            let hits = lock(&store).search(term, None, None, 0)?;
            assert_eq!(hits.len(), 1, "term {term} should match the indexed blob");
        }
        temp.close()?;
        Ok(())
    }
}
