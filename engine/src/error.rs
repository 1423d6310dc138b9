//! Error types for the Gitray engine.

use crate::{ItemId, Path};
use thiserror::Error;

/// All possible errors from the Gitray engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Content errors
    #[error("hash mismatch at '{path}': expected {expected}, got {actual}")]
    HashMismatch {
        path: Path,
        expected: String,
        actual: String,
    },

    #[error("failed to decode '{path}': {message}")]
    Decode { path: Path, message: String },

    #[error("invalid path: {0}")]
    InvalidPath(Path),

    // Patch errors
    #[error("cannot apply patch: {0}")]
    PatchApplication(String),

    // Action errors
    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("operation on deleted item: {0}")]
    OperationOnDeleted(ItemId),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Build a decode error for a path from any displayable cause.
    pub fn decode(path: impl Into<Path>, cause: impl std::fmt::Display) -> Self {
        Error::Decode {
            path: path.into(),
            message: cause.to_string(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::ItemNotFound("bill-1".into());
        assert_eq!(err.to_string(), "item not found: bill-1");

        let err = Error::HashMismatch {
            path: "bills/0.json".into(),
            expected: "aaa".into(),
            actual: "bbb".into(),
        };
        assert_eq!(
            err.to_string(),
            "hash mismatch at 'bills/0.json': expected aaa, got bbb"
        );

        let err = Error::decode("meta.json", "expected value at line 1");
        assert_eq!(
            err.to_string(),
            "failed to decode 'meta.json': expected value at line 1"
        );
    }
}
