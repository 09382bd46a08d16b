use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid partition URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid media body for {media_id}: {reason}")]
    InvalidMediaBody { media_id: String, reason: String },
}
