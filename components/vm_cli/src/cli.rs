//! Argument definitions

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Tiered bytecode engine
#[derive(Debug, Parser)]
#[command(name = "tiervm", version, about)]
pub struct Cli {
    /// More log output (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a code bundle
    Run(RunArgs),
    /// Print the instructions of a code bundle without running it
    Disassemble {
        /// Bundle file (JSON)
        file: PathBuf,
    },
}

/// Options for `run`
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Bundle file (JSON)
    pub file: PathBuf,

    /// Engine configuration file (JSON); flags override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Disable quickening
    #[arg(long)]
    pub no_specialize: bool,

    /// Disable trace recording and executors
    #[arg(long)]
    pub no_tier2: bool,

    /// Executions before an adaptive instruction specializes
    #[arg(long)]
    pub warmup: Option<u16>,

    /// Backward jumps before a loop is traced
    #[arg(long)]
    pub jump_threshold: Option<u16>,

    /// Longest trace the recorder accepts, in uops
    #[arg(long)]
    pub max_trace_length: Option<usize>,

    /// Print engine statistics after the run
    #[arg(short, long)]
    pub stats: bool,

    /// Print the (quickened) instructions after the run
    #[arg(short, long)]
    pub disassemble: bool,
}
