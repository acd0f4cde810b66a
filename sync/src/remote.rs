//! Capabilities a remote location must provide to take part in a sync.
//!
//! The snapshot file and the lock marker are two independently named entries
//! in the same remote directory. Exclusivity is a convention: a coordinator
//! that finds the marker stays away unless told to force.

use crate::error::TransportResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Access to the remote directory holding the shared snapshot.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Connect and enter the target directory.
    async fn open(&self) -> TransportResult<()>;

    /// Names of the entries in the target directory.
    async fn list_entries(&self) -> TransportResult<BTreeSet<String>>;

    /// Contents of an entry, or `None` if it does not exist.
    async fn download(&self, name: &str) -> TransportResult<Option<Vec<u8>>>;

    /// Create or replace an entry.
    async fn upload(&self, name: &str, bytes: &[u8]) -> TransportResult<()>;

    /// Drop the connection. Best effort.
    async fn close(&self) {}
}

/// The exclusive lock marker.
#[async_trait]
pub trait RemoteLock: Send + Sync {
    /// Write the marker, replacing any existing one.
    async fn create_marker(&self, name: &str, contents: &[u8]) -> TransportResult<()>;

    /// Remove the marker. Fails if it is not there.
    async fn delete_marker(&self, name: &str) -> TransportResult<()>;
}

/// A remote usable by the coordinator.
pub trait Remote: RemoteCollection + RemoteLock {}

impl<T: RemoteCollection + RemoteLock> Remote for T {}

/// Contents of the lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Identity of the coordinator that wrote the marker
    pub holder: String,
    /// When the marker was written
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of a string and a timestamp cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a marker's contents. Markers written by other tools may be
    /// empty or free-form, which yields `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// How long the marker has been held as of `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.acquired_at
    }
}
