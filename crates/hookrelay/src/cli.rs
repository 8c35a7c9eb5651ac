//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct CliArgs {
    /// Path to configuration file (can be specified multiple times; later
    /// files override earlier ones)
    #[arg(short, long, global = true)]
    pub config: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Accept webhooks on the ingress address
    Serve {
        /// Also run the topic consumer in this process
        #[arg(long)]
        with_consumer: bool,
    },
    /// Consume the ingest topic into the store
    Consume,
    /// Re-deliver fallback files and dead letters, then exit
    Reconcile,
}
