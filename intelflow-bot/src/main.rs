use anyhow::Result;
use clap::Parser;

use intelflow_bot::cli::BotCli;
use intelflow_bot::orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BotCli::parse();
    orchestrator::run(cli).await
}
