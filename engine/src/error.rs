//! Error types for the stash engine.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the stash engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("record not found: {0}")]
    UnknownRecord(RecordId),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("sync source not found: {0}")]
    UnknownSyncSource(String),

    // Persistence errors
    #[error("unreadable store{}: {reason}", path_suffix(.path))]
    UnreadableStore {
        path: Option<String>,
        reason: String,
    },

    #[error("failed to write store to {path}: {reason}")]
    StoreWrite { path: String, reason: String },

    #[error("value cannot be encoded: {0}")]
    Unencodable(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

fn path_suffix(path: &Option<String>) -> String {
    match path {
        Some(path) => format!(" {path}"),
        None => String::new(),
    }
}

impl Error {
    /// Build an [`Error::UnreadableStore`] for in-memory input.
    pub fn unreadable(reason: impl Into<String>) -> Self {
        Error::UnreadableStore {
            path: None,
            reason: reason.into(),
        }
    }

    /// Attach a file path to an [`Error::UnreadableStore`].
    pub(crate) fn at_path(self, path: &std::path::Path) -> Self {
        match self {
            Error::UnreadableStore { reason, .. } => Error::UnreadableStore {
                path: Some(path.display().to_string()),
                reason,
            },
            other => other,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
