use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bbp",
    about = "Blackboard persistence: inspect persisted deltas",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List rehydration candidates, newest first
    Sets(TargetArgs),
    /// List committed deltas with their headers
    Deltas(TargetArgs),
    /// Show the header of one delta file
    Header(HeaderArgs),
}

/// Where the agent directory is.
#[derive(Args)]
pub struct TargetArgs {
    /// Agent directory of a file medium
    #[arg(long, conflicts_with = "config")]
    pub dir: Option<PathBuf>,
    /// Persistence configuration (TOML); its file media are inspected
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Only this medium of the configuration
    #[arg(long, requires = "config")]
    pub medium: Option<String>,
}

#[derive(Args)]
pub struct HeaderArgs {
    pub file: PathBuf,
}
