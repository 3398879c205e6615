use clap::Parser;
use ralph_orchestrator::cli::{self, Cli};
use tracing::Level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    cli::run(cli).await?;
    Ok(())
}
