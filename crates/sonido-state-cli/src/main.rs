//! Sonido state CLI - inspect saved plugin state and run a live demo.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sonido-state")]
#[command(author, version, about = "Sonido plugin state tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the contents of a saved state document
    Inspect(commands::inspect::InspectArgs),

    /// Drive a plugin state from a simulated processing thread
    Demo(commands::demo::DemoArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect(args) => commands::inspect::run(args),
        Commands::Demo(args) => commands::demo::run(args),
    }
}
