//! Command-line interface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "nanobot", about = "Agent-orchestration runtime speaking ATP over HTTP")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the ATP endpoint.
    Run(RunArgs),
    /// Validate a configuration document and exit.
    Validate {
        /// Path to the rendered JSON configuration document.
        config: PathBuf,
    },
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Path to the rendered JSON configuration document.
    #[arg(long)]
    pub config: PathBuf,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// ATP endpoint path.
    #[arg(long, default_value = "/mcp")]
    pub endpoint: String,

    /// Liveness endpoint path.
    #[arg(long, default_value = "/healthz")]
    pub health: String,

    /// SQLite file for sessions and resources; in-memory stores when absent.
    #[arg(long)]
    pub state_db: Option<PathBuf>,

    /// External URL this instance is reachable at, used for OAuth redirects.
    #[arg(long)]
    pub public_url: Option<String>,
}
