//! CloudStore CLI
//!
//! Command-line tools for CloudStore sync stores.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and sync state
//! - `dump-journal` - Dump journal frames for debugging
//! - `simulate` - Run replicas against an in-memory record store

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// CloudStore command-line tools.
#[derive(Parser)]
#[command(name = "cloudstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and sync state
    Inspect {
        /// Path to the store journal
        path: PathBuf,

        /// Show per-record sync state
        #[arg(short, long)]
        records: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump journal frames for debugging
    DumpJournal {
        /// Path to the store journal
        path: PathBuf,

        /// Maximum number of frames to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Include full frame contents in JSON output
        #[arg(long)]
        full: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run replicas against an in-memory record store and check convergence
    Simulate {
        /// Number of replicas
        #[arg(long, default_value = "3")]
        replicas: usize,

        /// Number of edit rounds
        #[arg(long, default_value = "5")]
        rounds: usize,

        /// Number of distinct records
        #[arg(long, default_value = "4")]
        records: usize,

        /// Server change-feed page size
        #[arg(long, default_value = "200")]
        page_size: usize,

        /// Inject transient network failures
        #[arg(long)]
        flaky: bool,

        /// Keep replica journals under this directory
        #[arg(long)]
        storage: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
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
            path,
            records,
            format,
        } => {
            commands::inspect::run(&path, records, &format)?;
        }
        Commands::DumpJournal {
            path,
            limit,
            full,
            format,
        } => {
            commands::dump_journal::run(&path, limit, full, &format)?;
        }
        Commands::Simulate {
            replicas,
            rounds,
            records,
            page_size,
            flaky,
            storage,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                replicas,
                rounds,
                records,
                page_size,
                flaky,
                storage,
            };
            commands::simulate::run(options, &format)?;
        }
        Commands::Version => {
            println!("CloudStore CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Journal format v{}", cloudstore_cache::JOURNAL_VERSION);
        }
    }

    Ok(())
}
