//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Plexus - host hot-reloadable modules
#[derive(Parser)]
#[command(name = "plexus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "PLEXUS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Host the greeter module and poll for reloads
    Run {
        /// Load the greeter from its shared library and watch it
        #[arg(short, long)]
        dynamic: bool,

        /// Greeter library path (implies --dynamic)
        #[arg(short, long)]
        library: Option<PathBuf>,

        /// Poll interval in milliseconds
        #[arg(short, long, default_value_t = 250)]
        interval_ms: u64,

        /// Stop after this many polls
        #[arg(short = 'n', long)]
        iterations: Option<u64>,
    },

    /// Open a module library and resolve its entry symbol
    Inspect {
        /// Library path
        library: PathBuf,

        /// Entry symbol (derived from the file name by default)
        #[arg(short, long)]
        symbol: Option<String>,
    },

    /// Print a line whenever a file finishes being written
    Watch {
        /// File to watch
        path: PathBuf,

        /// Poll interval in milliseconds
        #[arg(short, long, default_value_t = 250)]
        interval_ms: u64,
    },

    /// Print the effective configuration
    Config,
}
