use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use time::OffsetDateTime;

use crate::search::bm25::{self, Bm25Scorer};
use crate::session::Session;
use crate::util;

const SCHEMA_VERSION: i32 = 1;
const DEFAULT_SNIPPET_LENGTH: usize = 300;
const SNIPPET_BOUNDARY_SCAN: usize = 50;

/// One ranked hit returned by [`SearchStore::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub session: Session,
    pub score: f64,
    pub snippet: String,
}

/// Persistent inverted index plus cached session metadata and content.
///
/// The store is a cache over the assistant source files: rows are created on
/// first search touch, replaced when the backing file's mtime advances, and
/// never deleted. Dropping the database only costs a re-index.
pub struct SearchStore {
    conn: Connection,
}

impl SearchStore {
    /// Open or create the index database at `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open search index at {}", path.display()))?;
        let store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r"
                PRAGMA foreign_keys = ON;
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                ",
            )
            .context("failed to configure index pragmas")?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let current: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap_or(0);

        // The index is derived state; on any schema mismatch, rebuild from
        // scratch and let lazy indexing repopulate it.
        if current != SCHEMA_VERSION {
            self.conn.execute_batch(
                r"
                DROP TABLE IF EXISTS term_index;
                DROP TABLE IF EXISTS sessions;
                DROP TABLE IF EXISTS search_stats;
                ",
            )?;
            self.create_schema()?;
        }

        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                project_path TEXT NOT NULL DEFAULT '',
                file_path TEXT NOT NULL,
                first_message TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                timestamp INTEGER NOT NULL DEFAULT 0,
                last_indexed INTEGER NOT NULL DEFAULT 0,
                file_mtime INTEGER NOT NULL DEFAULT 0,
                doc_length INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS term_index (
                term TEXT NOT NULL,
                session_id TEXT NOT NULL,
                term_frequency INTEGER NOT NULL,
                PRIMARY KEY (term, session_id),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS search_stats (
                key TEXT PRIMARY KEY,
                value REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_term_index_session ON term_index(session_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_source ON sessions(source);
            CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_path);

            INSERT OR IGNORE INTO search_stats (key, value) VALUES ('total_docs', 0);
            INSERT OR IGNORE INTO search_stats (key, value) VALUES ('avg_doc_length', 0);
            ",
        )?;

        let pragma = format!("PRAGMA user_version = {SCHEMA_VERSION}");
        self.conn.execute(&pragma, [])?;
        Ok(())
    }

    /// Index or re-index one session in a single transaction: replace the
    /// session row, rebuild its term rows, and recompute the corpus stats.
    /// On failure the transaction rolls back and prior state is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be stat'd or any
    /// statement fails.
    pub fn index_session(&mut self, session: &Session, content: &str) -> Result<()> {
        let mtime = util::file_mtime_unix(&session.file_path)?;
        let tokens = bm25::tokenize(content);
        let doc_length = i64::try_from(tokens.len()).unwrap_or(i64::MAX);
        let term_freqs = bm25::term_frequency(&tokens);
        let timestamp = session
            .timestamp
            .map_or(0, OffsetDateTime::unix_timestamp);
        let now = util::system_time_to_unix(std::time::SystemTime::now());

        let tx = self.conn.transaction()?;

        tx.execute(
            r"
            INSERT OR REPLACE INTO sessions
                (id, source, project_path, file_path, first_message, summary,
                 timestamp, last_indexed, file_mtime, doc_length, content)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                session.id,
                session.source,
                session.project_path,
                session.file_path.to_string_lossy(),
                session.first_message,
                session.summary,
                timestamp,
                now,
                mtime,
                doc_length,
                content,
            ],
        )?;

        tx.execute(
            "DELETE FROM term_index WHERE session_id = ?1",
            params![session.id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO term_index (term, session_id, term_frequency) VALUES (?1, ?2, ?3)",
            )?;
            for (term, freq) in &term_freqs {
                stmt.execute(params![term, session.id, freq])?;
            }
        }

        update_stats(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Whether `session_id` is missing from the index or its backing file
    /// has been modified since it was last indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be stat'd or the lookup fails.
    pub fn needs_reindex(&self, session_id: &str, file_path: &Path) -> Result<bool> {
        let cached: Option<i64> = self
            .conn
            .query_row(
                "SELECT file_mtime FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to check index freshness for {session_id}"))?;

        let Some(cached) = cached else {
            return Ok(true);
        };
        Ok(util::file_mtime_unix(file_path)? > cached)
    }

    /// BM25-ranked search over indexed sessions, with optional equality
    /// filters on source and project path. `limit == 0` means no limit.
    ///
    /// # Errors
    ///
    /// Fails with "no valid search terms" when the query tokenizes to
    /// nothing, and on any database error.
    pub fn search(
        &self,
        query: &str,
        source: Option<&str>,
        project_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let query_terms = bm25::tokenize(query);
        if query_terms.is_empty() {
            return Err(eyre!("no valid search terms"));
        }

        let (total_docs, avg_doc_length) = self.stats()?;
        let scorer = Bm25Scorer::new(avg_doc_length, total_docs);
        let doc_freqs = self.document_frequencies(&query_terms)?;

        let mut sql = String::from(
            r"
            SELECT DISTINCT s.id, s.source, s.project_path, s.file_path,
                   s.first_message, s.summary, s.timestamp, s.doc_length, s.content
            FROM sessions s
            JOIN term_index ti ON s.id = ti.session_id
            WHERE ti.term IN (",
        );
        sql.push_str(&placeholders(query_terms.len()));
        sql.push(')');

        let mut args: Vec<SqlValue> = query_terms
            .iter()
            .map(|term| SqlValue::from(term.clone()))
            .collect();
        if let Some(source) = source {
            sql.push_str(" AND s.source = ?");
            args.push(SqlValue::from(source.to_string()));
        }
        if let Some(project_path) = project_path {
            sql.push_str(" AND s.project_path = ?");
            args.push(SqlValue::from(project_path.to_string()));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), map_candidate)?;

        let mut results = Vec::new();
        for row in rows {
            let (session, doc_length, content) = row?;
            let term_freqs = self.term_frequencies(&session.id, &query_terms)?;
            let score = scorer.score(&query_terms, &term_freqs, doc_length, &doc_freqs);
            let snippet = extract_snippet(&content, &query_terms, DEFAULT_SNIPPET_LENGTH);
            results.push(SearchResult {
                session,
                score,
                snippet,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.session.id.cmp(&b.session.id))
        });
        if limit > 0 && results.len() > limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    fn stats(&self) -> Result<(i64, f64)> {
        let total_docs: f64 = self
            .conn
            .query_row(
                "SELECT value FROM search_stats WHERE key = 'total_docs'",
                [],
                |row| row.get(0),
            )
            .context("failed to read total_docs")?;
        let avg_doc_length: f64 = self
            .conn
            .query_row(
                "SELECT value FROM search_stats WHERE key = 'avg_doc_length'",
                [],
                |row| row.get(0),
            )
            .context("failed to read avg_doc_length")?;
        Ok((total_docs as i64, avg_doc_length))
    }

    fn document_frequencies(&self, terms: &[String]) -> Result<HashMap<String, i64>> {
        let sql = format!(
            "SELECT term, COUNT(DISTINCT session_id) FROM term_index WHERE term IN ({}) GROUP BY term",
            placeholders(terms.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(terms.iter()),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut freqs = HashMap::new();
        for row in rows {
            let (term, count) = row?;
            freqs.insert(term, count);
        }
        Ok(freqs)
    }

    fn term_frequencies(
        &self,
        session_id: &str,
        terms: &[String],
    ) -> Result<HashMap<String, i64>> {
        let sql = format!(
            "SELECT term, term_frequency FROM term_index WHERE session_id = ? AND term IN ({})",
            placeholders(terms.len())
        );
        let mut args: Vec<SqlValue> = vec![SqlValue::from(session_id.to_string())];
        args.extend(terms.iter().map(|term| SqlValue::from(term.clone())));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(args.iter()),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut freqs = HashMap::new();
        for row in rows {
            let (term, freq) = row?;
            freqs.insert(term, freq);
        }
        Ok(freqs)
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

fn update_stats(conn: &Connection) -> Result<()> {
    let (total_docs, total_length): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(doc_length), 0) FROM sessions",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let avg_doc_length = if total_docs > 0 {
        total_length as f64 / total_docs as f64
    } else {
        0.0
    };

    conn.execute(
        "UPDATE search_stats SET value = ?1 WHERE key = 'total_docs'",
        params![total_docs as f64],
    )?;
    conn.execute(
        "UPDATE search_stats SET value = ?1 WHERE key = 'avg_doc_length'",
        params![avg_doc_length],
    )?;
    Ok(())
}

fn map_candidate(row: &Row<'_>) -> rusqlite::Result<(Session, i64, String)> {
    let timestamp: i64 = row.get(6)?;
    let session = Session {
        id: row.get(0)?,
        source: row.get(1)?,
        project_path: row.get(2)?,
        file_path: PathBuf::from(row.get::<_, String>(3)?),
        first_message: row.get(4)?,
        user_message_count: 0,
        timestamp: (timestamp != 0)
            .then(|| OffsetDateTime::from_unix_timestamp(timestamp).ok())
            .flatten(),
        summary: row.get(5)?,
    };
    Ok((session, row.get(7)?, row.get(8)?))
}

/// Pull a short window of `content` around the earliest occurrence of any
/// query term, nudged to whitespace and marked with ellipses when truncated.
/// A `max_length` of 0 selects the default of 300 bytes.
#[must_use]
pub fn extract_snippet(content: &str, query_terms: &[String], max_length: usize) -> String {
    let max_length = if max_length == 0 {
        DEFAULT_SNIPPET_LENGTH
    } else {
        max_length
    };

    let lower = content.to_lowercase();
    let mut first_pos = content.len();
    let mut matched_len = 0;
    for term in query_terms {
        if let Some(pos) = lower.find(term.as_str())
            && pos < first_pos
        {
            first_pos = pos;
            matched_len = term.len();
        }
    }

    if first_pos == content.len() {
        if content.len() <= max_length {
            return content.to_string();
        }
        let cut = floor_char_boundary(content, max_length);
        return format!("{}...", &content[..cut]);
    }

    let half = max_length / 2;
    let mut start = first_pos.saturating_sub(half);
    let mut end = (first_pos + matched_len + half).min(content.len());

    let bytes = content.as_bytes();
    if start > 0 {
        let lowest = start.saturating_sub(SNIPPET_BOUNDARY_SCAN);
        let mut i = start;
        while i > 0 && i > lowest {
            if bytes[i] == b' ' || bytes[i] == b'\n' {
                start = i + 1;
                break;
            }
            i -= 1;
        }
    }
    if end < content.len() {
        let highest = end.saturating_add(SNIPPET_BOUNDARY_SCAN).min(content.len());
        let mut i = end;
        while i < highest {
            if bytes[i] == b' ' || bytes[i] == b'\n' {
                end = i;
                break;
            }
            i += 1;
        }
    }

    start = floor_char_boundary(content, start);
    end = floor_char_boundary(content, end);
    let mut snippet = content[start..end].to_string();
    if start > 0 {
        snippet.insert_str(0, "...");
    }
    if end < content.len() {
        snippet.push_str("...");
    }
    snippet
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;

    fn sample_session(id: &str, source: &str, project: &str, file_path: PathBuf) -> Session {
        Session {
            id: id.to_string(),
            source: source.to_string(),
            project_path: project.to_string(),
            first_message: "Initial intro".to_string(),
            user_message_count: 1,
            timestamp: Some(OffsetDateTime::from_unix_timestamp(1_720_000_000).expect("ts")),
            file_path,
            summary: "Summary info".to_string(),
        }
    }

    #[test]
    fn snippet_wraps_the_match_in_ellipses() {
        let content = "This is the beginning of the document. Important keyword appears here followed by more context.";
        let snippet = extract_snippet(content, &["keyword".to_string()], 40);
        assert!(snippet.contains("keyword"), "snippet: {snippet}");
        assert!(snippet.starts_with("..."), "snippet: {snippet}");
        assert!(snippet.ends_with("..."), "snippet: {snippet}");
    }

    #[test]
    fn snippet_without_match_returns_head_of_content() {
        let content = "word ".repeat(100);
        let snippet = extract_snippet(&content, &["absent".to_string()], 40);
        assert!(snippet.len() <= 43);
        assert!(snippet.ends_with("..."));

        let short = "tiny document";
        assert_eq!(extract_snippet(short, &["absent".to_string()], 40), short);
    }

    #[test]
    fn snippet_survives_multibyte_content() {
        let content = format!("{} keyword {}", "héllo ".repeat(30), "wörld ".repeat(30));
        let snippet = extract_snippet(&content, &["keyword".to_string()], 40);
        assert!(snippet.contains("keyword"), "snippet: {snippet}");
    }

    #[test]
    fn index_search_and_freshness_lifecycle() -> color_eyre::Result<()> {
        let temp = TempDir::new()?;
        let session_file = temp.child("session.jsonl");
        session_file.write_str("test")?;

        let mut store = SearchStore::open(temp.child("search.db").path())?;
        let session = sample_session(
            "sess-123",
            "codex",
            "/workspace",
            session_file.path().to_path_buf(),
        );

        let content = "Initial intro explains context. Keyword appears in the detailed content block to verify search.";
        store.index_session(&session, content)?;

        assert!(!store.needs_reindex("sess-123", session_file.path())?);

        let results = store.search("keyword", Some("codex"), Some("/workspace"), 5)?;
        assert_eq!(results.len(), 1, "expected exactly one hit");
        assert!(results[0].snippet.to_lowercase().contains("keyword"));
        assert!(results[0].score > 0.0);
        assert_eq!(results[0].session.id, "sess-123");

        let none = store.search("keyword", Some("other"), Some("/workspace"), 5)?;
        assert!(none.is_empty(), "mismatched source filter should exclude");

        let wrong_project = store.search("keyword", Some("codex"), Some("/elsewhere"), 5)?;
        assert!(wrong_project.is_empty());

        temp.close()?;
        Ok(())
    }

    #[test]
    fn needs_reindex_flips_when_mtime_advances() -> color_eyre::Result<()> {
        let temp = TempDir::new()?;
        let session_file = temp.child("session.jsonl");
        session_file.write_str("test")?;

        let mut store = SearchStore::open(temp.child("search.db").path())?;
        let session = sample_session(
            "sess-1",
            "codex",
            "/workspace",
            session_file.path().to_path_buf(),
        );
        store.index_session(&session, "hello keyword world")?;
        assert!(!store.needs_reindex("sess-1", session_file.path())?);

        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(session_file.path())?;
        file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(2))?;
        drop(file);

        assert!(store.needs_reindex("sess-1", session_file.path())?);
        temp.close()?;
        Ok(())
    }

    #[test]
    fn needs_reindex_is_true_for_unknown_sessions_and_errors_on_missing_files()
    -> color_eyre::Result<()> {
        let temp = TempDir::new()?;
        let mut store = SearchStore::open(temp.child("search.db").path())?;

        assert!(store.needs_reindex("never-seen", Path::new("/nonexistent"))?);

        let session_file = temp.child("session.jsonl");
        session_file.write_str("test")?;
        let session = sample_session(
            "sess-1",
            "codex",
            "/workspace",
            session_file.path().to_path_buf(),
        );
        store.index_session(&session, "content here")?;

        std::fs::remove_file(session_file.path())?;
        assert!(store.needs_reindex("sess-1", session_file.path()).is_err());
        temp.close()?;
        Ok(())
    }

    #[test]
    fn search_rejects_queries_without_valid_terms() -> color_eyre::Result<()> {
        let temp = TempDir::new()?;
        let store = SearchStore::open(temp.child("search.db").path())?;
        let err = store.search("a ! ?", None, None, 5).unwrap_err();
        assert!(format!("{err}").contains("no valid search terms"));
        temp.close()?;
        Ok(())
    }

    #[test]
    fn search_orders_results_by_descending_score() -> color_eyre::Result<()> {
        let temp = TempDir::new()?;
        let mut store = SearchStore::open(temp.child("search.db").path())?;

        for (id, repeats) in [("sess-a", 1), ("sess-b", 6), ("sess-c", 3)] {
            let file = temp.child(format!("{id}.jsonl"));
            file.write_str("raw")?;
            let session = sample_session(id, "codex", "/workspace", file.path().to_path_buf());
            let content = format!("{} plus unrelated filler text", "keyword ".repeat(repeats));
            store.index_session(&session, &content)?;
        }

        let results = store.search("keyword", None, None, 0)?;
        assert_eq!(results.len(), 3);
        for pair in results.windows(2) {
            assert!(
                pair[0].score >= pair[1].score,
                "scores out of order: {} < {}",
                pair[0].score,
                pair[1].score
            );
        }
        temp.close()?;
        Ok(())
    }

    #[test]
    fn reindexing_replaces_terms_instead_of_accumulating() -> color_eyre::Result<()> {
        let temp = TempDir::new()?;
        let session_file = temp.child("session.jsonl");
        session_file.write_str("v1")?;

        let mut store = SearchStore::open(temp.child("search.db").path())?;
        let session = sample_session(
            "sess-1",
            "codex",
            "/workspace",
            session_file.path().to_path_buf(),
        );
        store.index_session(&session, "alpha beta gamma")?;
        store.index_session(&session, "delta epsilon")?;

        assert!(store.search("alpha", None, None, 0)?.is_empty());
        assert_eq!(store.search("delta", None, None, 0)?.len(), 1);
        temp.close()?;
        Ok(())
    }

    #[test]
    fn schema_version_mismatch_recreates_the_database() -> color_eyre::Result<()> {
        let temp = TempDir::new()?;
        let db_path = temp.child("search.db").path().to_path_buf();
        let session_file = temp.child("session.jsonl");
        session_file.write_str("raw")?;

        {
            let mut store = SearchStore::open(&db_path)?;
            let session = sample_session(
                "sess-1",
                "codex",
                "/workspace",
                session_file.path().to_path_buf(),
            );
            store.index_session(&session, "keyword content")?;
        }

        let conn = Connection::open(&db_path)?;
        conn.execute("PRAGMA user_version = 999", [])?;
        drop(conn);

        let store = SearchStore::open(&db_path)?;
        assert!(
            store.needs_reindex("sess-1", session_file.path())?,
            "recreated index should have forgotten the session"
        );
        temp.close()?;
        Ok(())
    }
}
