//! Protocol error types.

use thiserror::Error;

/// Errors raised while reading or writing wire text.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The wire text is not valid JSON or does not match the expected shape.
    #[error("malformed wire payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A well-formed payload carried a result of the wrong shape.
    #[error("unexpected {operation} result: {found}")]
    UnexpectedResult {
        /// The operation whose result was being read.
        operation: &'static str,
        /// A rendering of what was received instead.
        found: String,
    },

    /// A value nests deeper than the wire allows.
    #[error("value nests {depth} levels deep, the wire allows {limit}")]
    TooDeep {
        /// Measured JSON nesting depth.
        depth: usize,
        /// The permitted maximum.
        limit: usize,
    },
}

/// Result type for wire operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
