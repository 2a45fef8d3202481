//! Error types for the CLI

use std::path::PathBuf;

use bytecode_system::BundleError;
use interpreter::EngineError;
use thiserror::Error;

/// CLI-specific errors
#[derive(Debug, Error)]
pub enum CliError {
    /// A file could not be read
    #[error("could not read '{path}': {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The configuration file is not valid
    #[error("invalid configuration '{path}': {source}")]
    Config {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },

    /// The bundle could not be loaded
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// Execution failed
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CliError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Engine(EngineError::Uncaught(_)) => 1,
            CliError::Engine(_) => 3,
            _ => 2,
        }
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
