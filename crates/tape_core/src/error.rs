//! Error types for tape recording, checkpointing and replay.
//!
//! All layers share [`TapeError`]. Variants fall into a small number of
//! categories reported by [`TapeError::kind`], so callers can separate
//! configuration mistakes they can fix from internal invariant violations
//! that indicate a bug or a corrupted tier.

use thiserror::Error;

/// Broad classification of a [`TapeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid configuration supplied by the caller.
    Configuration,
    /// Operation not permitted in the current manager state.
    Usage,
    /// Internal invariant violated during checkpointing or replay.
    Internal,
    /// Failure reported by, or caused by, a domain equation.
    Domain,
    /// Slow-tier I/O or (de)serialisation failure.
    Storage,
}

/// Errors raised by the tape, the checkpoint layer and the reverse sweep.
///
/// # Examples
///
/// ```
/// use tape_core::{ErrorKind, TapeError};
///
/// let err = TapeError::UnrecognizedMode("revolve2".to_string());
/// assert_eq!(err.kind(), ErrorKind::Configuration);
/// assert!(err.is_configuration());
///
/// let err = TapeError::ReplayInvariantViolation { remaining: 2 };
/// assert!(err.is_internal());
/// ```
#[derive(Debug, Error)]
pub enum TapeError {
    /// Operation issued in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Checkpointing mode name not recognised.
    #[error("Unrecognized checkpointing mode: {0}")]
    UnrecognizedMode(String),

    /// Snapshot format name not recognised.
    #[error("Unrecognized snapshot format: {0}")]
    UnrecognizedFormat(String),

    /// Parameter out of range or inconsistent with other parameters.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A stored value or snapshot required for the reverse sweep is absent.
    #[error("Missing checkpoint data: {0}")]
    MissingData(String),

    /// Replay finished with values still pending release.
    #[error("Replay storage not empty after replay ({remaining} value(s) remaining)")]
    ReplayInvariantViolation {
        /// Number of values left in the replay store
        remaining: usize,
    },

    /// Reverse-sweep bookkeeping left inconsistent.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Ranks disagree on data that must be replicated.
    #[error("Parallel desynchronization detected: {0}")]
    DesynchronizationDetected(String),

    /// Field length does not match its function space.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected number of components
        expected: usize,
        /// Actual number of components
        got: usize,
    },

    /// Failure inside a domain equation.
    #[error("Equation error: {0}")]
    Equation(String),

    /// Slow-tier file system error.
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Slow-tier encoding or decoding error.
    #[error("Snapshot serialization error: {0}")]
    Serialization(String),
}

impl TapeError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TapeError::UnrecognizedMode(_)
            | TapeError::UnrecognizedFormat(_)
            | TapeError::InvalidParameter(_) => ErrorKind::Configuration,
            TapeError::InvalidState(_) => ErrorKind::Usage,
            TapeError::MissingData(_)
            | TapeError::ReplayInvariantViolation { .. }
            | TapeError::InvariantViolation(_)
            | TapeError::DesynchronizationDetected(_) => ErrorKind::Internal,
            TapeError::DimensionMismatch { .. } | TapeError::Equation(_) => ErrorKind::Domain,
            TapeError::Io(_) | TapeError::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller can fix this by changing the configuration.
    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Whether this indicates an internal invariant violation.
    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    /// Shorthand for [`TapeError::InvalidState`].
    pub fn invalid_state(message: impl Into<String>) -> Self {
        TapeError::InvalidState(message.into())
    }

    /// Shorthand for [`TapeError::MissingData`].
    pub fn missing(message: impl Into<String>) -> Self {
        TapeError::MissingData(message.into())
    }
}

/// Result type for tape operations.
pub type TapeResult<T> = Result<T, TapeError>;
