//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dpf_core::{Arch, EngineType};

/// DPF device trace reconstruction.
///
/// Decodes raw profiler records, pairs them into activities, attributes
/// them to runtime tasks and compiled ops, and maps device cycles onto
/// host time.
#[derive(Debug, Parser)]
#[command(name = "dpf", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Chip architecture (overrides config).
    #[arg(short, long, global = true)]
    pub arch: Option<Arch>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print decoded events of a binary record file.
    Decode {
        /// File of 16-byte little-endian records.
        file: PathBuf,

        /// Stop after this many events.
        #[arg(long)]
        limit: Option<usize>,

        /// Only show events of this engine type (e.g. CQM, SIP).
        #[arg(long)]
        engine: Option<EngineType>,
    },

    /// Decode hex master words, one per line.
    Masters {
        /// Text file of hex words.
        file: PathBuf,
    },

    /// Print the master-value table of the architecture.
    Topology,

    /// Run the full pipeline on a binary record file.
    Process {
        /// File of 16-byte little-endian records.
        file: PathBuf,

        /// Directory holding runtime_task.txt, timepoints.txt and
        /// executable dumps (overrides config).
        #[arg(long)]
        meta_dir: Option<PathBuf>,

        /// Pairing worker threads (overrides config).
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },
}
