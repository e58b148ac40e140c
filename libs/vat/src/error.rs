//! Error types for vat identity parsing.

use thiserror::Error;

/// Errors that can occur when decoding vat identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VatError {
    /// The identity string has the wrong length.
    #[error("vat id must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The identity string is not valid hex.
    #[error("invalid hex in vat id: {0}")]
    InvalidHex(String),
}
