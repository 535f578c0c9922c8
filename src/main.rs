use action_gateway::cli::{self, Cli, Command};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate(args) => cli::validate::run(args).await,
        Command::Dag(args) => cli::dag::run(args).await,
        Command::Run(args) => cli::run::run(args).await,
    }
}
