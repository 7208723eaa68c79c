//! RPC Ramp CLI
//!
//! Inspects and controls a running ramp (status, abort) and renders the
//! results of finished runs from their run directories.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{abort, report, status};
use std::path::PathBuf;

/// RPC Ramp CLI
#[derive(Parser)]
#[command(name = "rampctl")]
#[command(author, version, about = "CLI for the RPC QPS ramp runner", long_about = None)]
pub struct Cli {
    /// Runner API URL (can also be set via RAMP_API_URL env var)
    #[arg(long, env = "RAMP_API_URL", default_value = "http://localhost:9184")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the state of the running ramp
    Status,

    /// Stop the running ramp before its next level
    Abort,

    /// Summarize a run directory
    Report {
        /// Run directory written by ramp-runner
        run_dir: PathBuf,

        /// Only show levels that raised a bottleneck or an anomaly
        #[arg(long)]
        flagged_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let client = client::ApiClient::new(&cli.api_url)?;
            status::show_status(&client, cli.format).await?;
        }
        Commands::Abort => {
            let client = client::ApiClient::new(&cli.api_url)?;
            abort::abort_run(&client, cli.format).await?;
        }
        Commands::Report {
            run_dir,
            flagged_only,
        } => {
            report::show_report(&run_dir, flagged_only, cli.format)?;
        }
    }

    Ok(())
}
