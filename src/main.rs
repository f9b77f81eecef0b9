use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = ai_sessions_mcp::Cli::parse();
    ai_sessions_mcp::run(&cli).await
}
