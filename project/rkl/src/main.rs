// src/main.rs

use clap::Parser;
use rkl::{NodeCommand, node_execute};
use tracing::error;

#[derive(Parser)]
#[command(name = "rkl")]
#[command(
    about = "Node agent that turns CRI state changes into pod lifecycle events",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: NodeCommand,
}

impl Cli {
    fn run(self) -> Result<(), anyhow::Error> {
        node_execute(self.command)
    }
}

fn main() -> Result<(), anyhow::Error> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    cli.run().inspect_err(|err| error!("Failed to run: {err:#}"))
}
