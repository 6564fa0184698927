//! Command-line interface for voxpipe.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "voxpipe", version, about = "Streaming voice AI pipeline gateway")]
pub struct Cli {
    /// Path to the configuration file (defaults to
    /// ~/.config/voxpipe/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the API server (the default when no command is given)
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        host: Option<String>,

        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate configuration and chain wiring, then exit
    Check,
    /// Print the request body JSON schema
    Schema,
}
