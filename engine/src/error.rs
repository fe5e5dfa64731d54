//! Error types for the Tandem engine.

use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Patch errors
    #[error("invalid JSON pointer: {0}")]
    InvalidPointer(String),

    #[error("operation {index}: path not found: {path}")]
    PathNotFound { index: usize, path: String },

    #[error("operation {index}: array index out of bounds at {path}")]
    IndexOutOfBounds { index: usize, path: String },

    #[error("operation {index}: test failed at {path}")]
    TestFailed { index: usize, path: String },

    #[error("operation {index}: cannot {op} at {path}: {reason}")]
    InvalidTarget {
        index: usize,
        op: &'static str,
        path: String,
        reason: String,
    },

    // State errors
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid partial state: {0}")]
    InvalidPartial(String),

    #[error("invalid state filter: {0}")]
    InvalidFilter(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport is not connected")]
    NotConnected,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
