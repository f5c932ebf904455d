use std::time::Duration;

use candle_core::DType;
use thiserror::Error;

use crate::distributed::reduce::ReduceOp;

/// Errors surfaced by the collective engine.
///
/// Cloneable so that a single failure can be reported to every caller
/// waiting on the same `Work`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectiveError {
    #[error("Rank {rank} unreachable: {reason}")]
    Connectivity { rank: usize, reason: String },

    #[error("Size mismatch: expected {expected} elements, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Unsupported operation: {op:?} on {dtype:?}")]
    UnsupportedOperation { op: ReduceOp, dtype: DType },

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Collective canceled")]
    Canceled,

    #[error("Collective aborted by rank {rank}: {reason}")]
    Aborted { rank: usize, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Candle error: {0}")]
    Candle(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<candle_core::Error> for CollectiveError {
    fn from(e: candle_core::Error) -> Self {
        CollectiveError::Candle(e.to_string())
    }
}

impl From<std::io::Error> for CollectiveError {
    fn from(e: std::io::Error) -> Self {
        CollectiveError::Io(e.to_string())
    }
}

impl CollectiveError {
    /// Whether this error ends the collective on every rank (as opposed to a
    /// wait that simply ran out of time).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CollectiveError::TimedOut(_))
    }
}

pub type Result<T> = std::result::Result<T, CollectiveError>;
