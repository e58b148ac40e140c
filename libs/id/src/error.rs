//! Error types for machine name parsing.

use thiserror::Error;

/// Errors that can occur when parsing machine names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The machine name is empty.
    #[error("machine name cannot be empty")]
    Empty,

    /// The machine name has no numeric suffix.
    #[error("machine name '{0}' is missing its index")]
    MissingIndex(String),

    /// The role portion does not name a machine type.
    #[error("unknown machine type '{0}'")]
    UnknownType(String),

    /// The index portion is not a valid non-negative integer.
    #[error("invalid machine index '{text}': {source}")]
    InvalidIndex {
        text: String,
        source: std::num::ParseIntError,
    },
}

impl IdError {
    /// Returns true if this error indicates an unknown machine type.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, IdError::UnknownType(_))
    }
}
