//! CLI command definitions and dispatch.

mod move_chart;
mod version;

use clap::{Parser, Subcommand};

/// Relok - relocate charts and the container images they reference.
#[derive(Parser)]
#[command(name = "relok", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Relocate a chart's images and rewrite the chart, or archive both
    Move(move_chart::MoveArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Move(args) => move_chart::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
