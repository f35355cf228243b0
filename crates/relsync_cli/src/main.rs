//! relsync CLI
//!
//! Command-line tools for inspecting and rehearsing flushes.
//!
//! # Commands
//!
//! - `plan` - Print the dependency forest of a fixture
//! - `simulate` - Flush a fixture against the in-memory store

mod commands;
mod fixture;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Plan and simulate dependency-ordered flushes.
#[derive(Parser)]
#[command(name = "relsync")]
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
    /// Print the roots and dependency tree of a fixture
    Plan {
        /// Fixture file
        fixture: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Flush a fixture against an in-memory store
    Simulate {
        /// Fixture file
        fixture: PathBuf,

        /// Latency of every store call, in milliseconds
        #[arg(short, long, default_value = "0")]
        latency_ms: u64,

        /// Reject writes of a type with an error on a field (TYPE:FIELD)
        #[arg(long, value_name = "TYPE:FIELD")]
        fail: Vec<String>,

        /// Echo has-many collections in store responses
        #[arg(long)]
        echo_has_many: bool,

        /// Stop pending subtrees after the first failure
        #[arg(long)]
        cancel_pending: bool,

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
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Plan { fixture, format } => {
            commands::plan::run(&fixture, &format)?;
        }
        Commands::Simulate {
            fixture,
            latency_ms,
            fail,
            echo_has_many,
            cancel_pending,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                latency_ms,
                failures: fail,
                echo_has_many,
                cancel_pending,
            };
            commands::simulate::run(&fixture, &options, &format)?;
        }
        Commands::Version => {
            println!("relsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
