//! Command-line driver for the tiered engine
//!
//! Loads compiled code bundles (JSON), runs them under a configurable
//! [`EngineConfig`](interpreter::EngineConfig) and reports results, statistics and
//! disassembly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod error;
pub mod runtime;

pub use cli::{Cli, Command, RunArgs};
pub use error::{CliError, CliResult};
pub use runtime::Runtime;
