mod cmd;
mod config;

use clap::{Parser, Subcommand};
use std::future::Future;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[clap(author, version, about = "a relay between block proposers and builders", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run(cmd::run::Command),
    Config(cmd::config::Command),
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn run_task(task: impl Future<Output = eyre::Result<()>>) -> eyre::Result<()> {
    setup_logging();

    // impl #[tokio::main]
    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(task)
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(cmd) => run_task(cmd.execute()),
        Commands::Config(cmd) => run_task(cmd.execute()),
    }
}
