use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// The binary has no subcommands of its own: running it enters the MCP
/// dispatcher on stdio.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about,
    long_about = None,
    name = "ai-sessions-mcp",
    bin_name = "ai-sessions-mcp"
)]
pub struct Cli {
    /// Override the search index database path.
    #[arg(long, value_name = "FILE")]
    pub db_path: Option<PathBuf>,
    /// Increase log verbosity (use -vv for trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    /// Silence all log output.
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub quiet: bool,
}
