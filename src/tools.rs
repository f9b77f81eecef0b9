use std::sync::{Arc, Mutex, PoisonError};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapters::{self, SessionAdapter};
use crate::indexer;
use crate::search::store::{SearchResult, SearchStore};
use crate::session::{Message, Session};

const DEFAULT_LIST_LIMIT: usize = 10;
const DEFAULT_SEARCH_LIMIT: usize = 10;
const DEFAULT_PAGE_SIZE: usize = 20;

/// MCP service exposing the four read-only session tools over the adapters
/// and the search index.
#[derive(Clone)]
pub struct SessionsService {
    adapters: Arc<Vec<Arc<dyn SessionAdapter>>>,
    store: Arc<Mutex<SearchStore>>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListSessionsRequest {
    /// Filter by source tag (claude, gemini, codex, opencode). Leave empty
    /// for all sources.
    #[schemars(description = "Filter by source tag (claude, gemini, codex, opencode)")]
    pub source: Option<String>,
    /// Filter by absolute project directory path.
    #[schemars(description = "Filter by absolute project directory path")]
    pub project_path: Option<String>,
    /// Maximum number of sessions to return (default 10).
    #[schemars(description = "Maximum number of sessions to return (default 10)")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchSessionsRequest {
    /// Search query to find in session content.
    #[schemars(description = "Search query to find in session content")]
    pub query: String,
    /// Filter by source tag. Leave empty for all sources.
    #[schemars(description = "Filter by source tag (claude, gemini, codex, opencode)")]
    pub source: Option<String>,
    /// Filter by absolute project directory path.
    #[schemars(description = "Filter by absolute project directory path")]
    pub project_path: Option<String>,
    /// Maximum number of matches to return (default 10).
    #[schemars(description = "Maximum number of matches to return (default 10)")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct GetSessionRequest {
    /// The session id to retrieve.
    #[schemars(description = "The session id to retrieve")]
    pub id: String,
    /// The source that created the session (claude, gemini, codex, opencode).
    #[schemars(description = "The source that created the session")]
    pub source: String,
    /// Page number, 0-indexed (default 0).
    #[schemars(description = "Page number for pagination, 0-indexed")]
    pub page: Option<usize>,
    /// Messages per page (default 20).
    #[schemars(description = "Number of messages per page (default 20)")]
    pub page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SourceInfo {
    pub name: &'static str,
    pub full_name: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SourcesResponse {
    pub sources: Vec<SourceInfo>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<Session>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchSessionsResponse {
    pub query: String,
    pub matches: Vec<SearchResult>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct GetSessionResponse {
    pub session_id: String,
    pub source: String,
    pub page: usize,
    pub page_size: usize,
    pub messages: Vec<Message>,
    pub count: usize,
}

impl SessionsService {
    #[must_use]
    pub fn new(adapters: Vec<Arc<dyn SessionAdapter>>, store: SearchStore) -> Self {
        Self {
            adapters: Arc::new(adapters),
            store: Arc::new(Mutex::new(store)),
            tool_router: Self::tool_router(),
        }
    }

    fn select_adapters(&self, source: Option<&str>) -> Result<Vec<Arc<dyn SessionAdapter>>> {
        match source {
            None => Ok(self.adapters.iter().cloned().collect()),
            Some(tag) => self
                .adapters
                .iter()
                .find(|adapter| adapter.name() == tag)
                .cloned()
                .map(|adapter| vec![adapter])
                .ok_or_else(|| eyre!("unknown source: {tag}")),
        }
    }

    /// Shared by the tool wrapper and tests: fan out listing to the selected
    /// adapters, merge newest-first, and cap to `limit`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown source tag; per-adapter failures are logged and
    /// skipped as long as other adapters can still contribute.
    pub async fn run_list_sessions(
        &self,
        request: ListSessionsRequest,
    ) -> Result<ListSessionsResponse> {
        let selected = self.select_adapters(non_empty(&request.source))?;
        let limit = request.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let project_path = non_empty(&request.project_path).map(str::to_string);

        let mut handles = Vec::with_capacity(selected.len());
        for adapter in selected {
            let project_path = project_path.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let result = adapter.list_sessions(project_path.as_deref(), limit);
                (adapter.name(), result)
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(batch))) => sessions.extend(batch),
                Ok((name, Err(err))) => {
                    tracing::warn!(source = name, "listing sessions failed: {err:#}");
                }
                Err(err) => tracing::warn!("listing task failed: {err}"),
            }
        }

        adapters::sort_sessions_newest_first(&mut sessions);
        if limit > 0 && sessions.len() > limit {
            sessions.truncate(limit);
        }
        Ok(ListSessionsResponse {
            count: sessions.len(),
            sessions,
        })
    }

    /// Shared by the tool wrapper and tests: lazily refresh the index for
    /// the selected scope, then run the ranked query. Indexing failures are
    /// logged and never fail the search.
    ///
    /// # Errors
    ///
    /// Fails on an empty query, an unknown source tag, or a search error.
    pub async fn run_search_sessions(
        &self,
        request: SearchSessionsRequest,
        cancel: CancellationToken,
    ) -> Result<SearchSessionsResponse> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(eyre!("query is required"));
        }
        let selected = self.select_adapters(non_empty(&request.source))?;
        let limit = request.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let source = non_empty(&request.source).map(str::to_string);
        let project_path = non_empty(&request.project_path).map(str::to_string);

        let store = Arc::clone(&self.store);
        let index_project = project_path.clone();
        let index_result = tokio::task::spawn_blocking(move || {
            indexer::refresh_index(&store, &selected, index_project.as_deref(), &cancel)
        })
        .await;
        match index_result {
            Ok(report) => {
                tracing::debug!(
                    scanned = report.scanned,
                    indexed = report.indexed,
                    skipped = report.skipped,
                    errors = report.errors.len(),
                    "lazy indexing pass finished"
                );
            }
            Err(err) => tracing::warn!("lazy indexing task failed: {err}"),
        }

        let store = Arc::clone(&self.store);
        let search_query = query.clone();
        let matches = tokio::task::spawn_blocking(move || {
            let store = store.lock().unwrap_or_else(PoisonError::into_inner);
            store.search(
                &search_query,
                source.as_deref(),
                project_path.as_deref(),
                limit,
            )
        })
        .await
        .map_err(|err| eyre!("search task failed: {err}"))??;

        Ok(SearchSessionsResponse {
            query,
            count: matches.len(),
            matches,
        })
    }

    /// Shared by the tool wrapper and tests: delegate to the named adapter.
    ///
    /// # Errors
    ///
    /// Fails on missing arguments, an unknown source tag, or when the
    /// adapter cannot resolve the session.
    pub async fn run_get_session(&self, request: GetSessionRequest) -> Result<GetSessionResponse> {
        let id = request.id.trim().to_string();
        if id.is_empty() {
            return Err(eyre!("id is required"));
        }
        let source = request.source.trim().to_string();
        if source.is_empty() {
            return Err(eyre!("source is required"));
        }
        let adapter = self
            .adapters
            .iter()
            .find(|adapter| adapter.name() == source)
            .cloned()
            .ok_or_else(|| eyre!("unknown source: {source}"))?;

        let page = request.page.unwrap_or(0);
        let page_size = match request.page_size {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(size) => size,
        };

        let session_id = id.clone();
        let messages =
            tokio::task::spawn_blocking(move || adapter.get_session(&session_id, page, page_size))
                .await
                .map_err(|err| eyre!("get-session task failed: {err}"))??;

        Ok(GetSessionResponse {
            session_id: id,
            source,
            page,
            page_size,
            count: messages.len(),
            messages,
        })
    }
}

#[tool_router]
impl SessionsService {
    #[tool(
        name = "list-available-sources",
        description = "List which coding assistant sources have session adapters registered (claude, gemini, codex, opencode)."
    )]
    pub async fn list_available_sources(&self) -> Result<CallToolResult, McpError> {
        let sources: Vec<SourceInfo> = self
            .adapters
            .iter()
            .map(|adapter| SourceInfo {
                name: adapter.name(),
                full_name: source_title(adapter.name()),
            })
            .collect();
        let response = SourcesResponse {
            count: sources.len(),
            sources,
        };
        Ok(json_result(&response))
    }

    #[tool(
        name = "list-sessions",
        description = "List recent coding assistant sessions with optional filtering by source and project path."
    )]
    pub async fn list_sessions(
        &self,
        Parameters(request): Parameters<ListSessionsRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.run_list_sessions(request).await {
            Ok(response) => Ok(json_result(&response)),
            Err(err) => Ok(tool_error(&err)),
        }
    }

    #[tool(
        name = "search-sessions",
        description = "Search indexed session transcripts for a query, ranked by relevance with contextual snippets."
    )]
    pub async fn search_sessions(
        &self,
        Parameters(request): Parameters<SearchSessionsRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match self.run_search_sessions(request, context.ct.clone()).await {
            Ok(response) => Ok(json_result(&response)),
            Err(err) => Ok(tool_error(&err)),
        }
    }

    #[tool(
        name = "get-session",
        description = "Get the full content of a session with pagination support."
    )]
    pub async fn get_session(
        &self,
        Parameters(request): Parameters<GetSessionRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.run_get_session(request).await {
            Ok(response) => Ok(json_result(&response)),
            Err(err) => Ok(tool_error(&err)),
        }
    }
}

#[tool_handler]
impl ServerHandler for SessionsService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "This server provides access to coding assistant CLI sessions from Claude Code, \
                 Gemini CLI, OpenAI Codex, and opencode. Use the tools to search, list, and read \
                 previous coding sessions."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }
}

fn source_title(name: &str) -> &'static str {
    match name {
        "claude" => "Claude Code",
        "gemini" => "Gemini CLI",
        "codex" => "OpenAI Codex",
        "opencode" => "opencode",
        _ => "unknown",
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn json_result<T: Serialize>(value: &T) -> CallToolResult {
    match serde_json::to_string_pretty(value) {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(err) => CallToolResult::error(vec![Content::text(format!(
            "failed to serialize result: {err}"
        ))]),
    }
}

fn tool_error(err: &color_eyre::Report) -> CallToolResult {
    CallToolResult::error(vec![Content::text(format!("Error: {err:#}"))])
}
