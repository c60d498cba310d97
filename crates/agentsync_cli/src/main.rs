//! agentsync CLI
//!
//! Command-line tools for agentsync queue files.
//!
//! # Commands
//!
//! - `inspect` - List modules and their pending diffs
//! - `purge` - Drop every pending diff of a module
//! - `compact` - Rewrite the journal without dead records
//! - `verify` - Check journal integrity
//! - `simulate` - Run an in-memory round against a loopback manager

mod commands;

use agentsync_protocol::SeqRange;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// agentsync command-line queue tools.
#[derive(Parser)]
#[command(name = "agentsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List modules and pending diffs
    Inspect {
        /// Only show this module
        #[arg(short, long)]
        module: Option<String>,

        /// Lowest seq to show
        #[arg(long)]
        from: Option<u64>,

        /// Highest seq to show
        #[arg(long)]
        to: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Drop every pending diff of a module
    Purge {
        /// Module to purge
        #[arg(short, long)]
        module: String,
    },

    /// Rewrite the journal without dead records
    Compact,

    /// Check journal integrity
    Verify,

    /// Run an in-memory round against a loopback manager
    Simulate {
        /// Number of diffs to synchronize
        #[arg(short, long, default_value = "10")]
        items: usize,

        /// Data frames per second, 0 for unthrottled
        #[arg(long, default_value = "0")]
        max_eps: usize,

        /// Seqs the manager loses once and requests again
        #[arg(long, num_args = 1..)]
        drop: Vec<u64>,

        /// Seconds to wait for each acknowledgment
        #[arg(long, default_value = "5")]
        timeout: u64,

        /// Attempts for Start and End
        #[arg(long, default_value = "3")]
        retries: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            module,
            from,
            to,
            format,
        } => {
            let path = cli.path.ok_or("Queue path required for inspect")?;
            let range = (from.is_some() || to.is_some())
                .then(|| SeqRange::new(from.unwrap_or(0), to.unwrap_or(u64::MAX)));
            commands::inspect::run(&path, module.as_deref(), range, &format)?;
        }
        Commands::Purge { module } => {
            let path = cli.path.ok_or("Queue path required for purge")?;
            commands::purge::run(&path, &module)?;
        }
        Commands::Compact => {
            let path = cli.path.ok_or("Queue path required for compact")?;
            commands::compact::run(&path)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Queue path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Simulate {
            items,
            max_eps,
            drop,
            timeout,
            retries,
        } => {
            let options = commands::simulate::SimulateOptions {
                items,
                max_eps,
                drop,
                timeout: std::time::Duration::from_secs(timeout),
                retries,
            };
            commands::simulate::run(&options)?;
        }
    }

    Ok(())
}
