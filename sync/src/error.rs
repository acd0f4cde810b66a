//! Error types for remote synchronization.

use crate::remote::LockInfo;

/// Failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    #[error("remote directory not found: {0}")]
    DirectoryMissing(String),

    #[error("{0}")]
    Io(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Why a sync attempt stopped.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{}", lock_held_message(.holder))]
    LockHeld { holder: Option<LockInfo> },

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote directory not found: {0}")]
    DirectoryMissing(String),

    #[error("remote {op} failed: {reason}")]
    RemoteIo { op: &'static str, reason: String },

    #[error("merge failed: {0}")]
    MergeFailed(#[source] stash_engine::Error),

    #[error("sync cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] stash_engine::Error),
}

fn lock_held_message(holder: &Option<LockInfo>) -> String {
    match holder {
        Some(info) => format!(
            "remote lock held by {} since {}",
            info.holder,
            info.acquired_at.to_rfc3339()
        ),
        None => "remote lock held".to_string(),
    }
}

impl SyncError {
    /// Map a transport failure from the named operation.
    pub(crate) fn from_transport(op: &'static str, err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(reason) => SyncError::RemoteUnreachable(reason),
            TransportError::DirectoryMissing(dir) => SyncError::DirectoryMissing(dir),
            TransportError::Io(reason) => SyncError::RemoteIo { op, reason },
        }
    }
}
