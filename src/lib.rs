pub mod adapters;
pub mod cli;
pub mod indexer;
pub mod search;
pub mod session;
pub mod tools;

mod util;

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use directories::BaseDirs;
use rmcp::ServiceExt;
use rmcp::transport::stdio;

pub use cli::Cli;

use crate::search::store::SearchStore;
use crate::tools::SessionsService;

/// Run the MCP dispatcher over stdio until the client disconnects.
///
/// # Errors
///
/// Returns an error when the home directory cannot be determined, the index
/// database cannot be opened, or the transport fails.
pub async fn run(cli: &Cli) -> Result<()> {
    init_tracing(cli);

    let home = BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| eyre!("failed to determine home directory"))?;
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| default_db_path(&home));
    let store = SearchStore::open(&db_path)?;
    let adapters = adapters::default_adapters(&home);

    tracing::info!(
        db = %db_path.display(),
        sources = adapters.len(),
        "serving session tools over stdio"
    );
    let service = SessionsService::new(adapters, store).serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

/// Default index location under the user's cache directory.
#[must_use]
pub fn default_db_path(home: &Path) -> PathBuf {
    home.join(".cache").join("ai-sessions").join("search.db")
}

fn init_tracing(cli: &Cli) {
    // stdout carries the MCP transport; every log line goes to stderr.
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(desired_level(cli).into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn desired_level(cli: &Cli) -> tracing::level_filters::LevelFilter {
    if cli.quiet {
        return tracing::level_filters::LevelFilter::ERROR;
    }

    match cli.verbose {
        0 => tracing::level_filters::LevelFilter::INFO,
        1 => tracing::level_filters::LevelFilter::DEBUG,
        _ => tracing::level_filters::LevelFilter::TRACE,
    }
}
