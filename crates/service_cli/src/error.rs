//! CLI error types.

use tape_core::TapeError;
use thiserror::Error;

/// Errors reported by the CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Tape(#[from] TapeError),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The adjoint and finite-difference derivatives disagree.
    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
