use std::path::PathBuf;
use thiserror::Error;

/// Why a persisted document could not be used. Always recovered locally.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("document is empty")]
    Empty,
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected document shape: {0}")]
    Shape(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Persist failure. The in-memory state stays authoritative.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddError {
    #[error("keyword cannot be empty")]
    EmptyKeyword,
    #[error("keyword limit reached ({limit} per scope)")]
    CapacityExceeded { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern cannot be empty")]
    EmptyPattern,
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
