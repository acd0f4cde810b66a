//! # Stash Sync
//!
//! Synchronizes a local [`stash_engine::Store`] with a copy kept in a shared
//! remote directory. The remote holds one snapshot file and, while a client
//! is syncing, an exclusive lock marker next to it.
//!
//! A [`SyncCoordinator`] runs one attempt at a time against anything that
//! implements [`RemoteCollection`] and [`RemoteLock`]; [`FsRemote`] is the
//! directory-backed implementation.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fs_remote;
pub mod remote;

pub use config::{ConfigError, SyncConfig};
pub use coordinator::{
    Resumption, SyncCoordinator, SyncFailure, SyncOptions, SyncReport, SyncState,
};
pub use error::{SyncError, TransportError, TransportResult};
pub use fs_remote::FsRemote;
pub use remote::{LockInfo, Remote, RemoteCollection, RemoteLock};
