//! One lock-guarded sync attempt between the local store and a remote.
//!
//! An attempt walks through
//! `Connecting → DirectoryReady → LockCheck → LockAcquired → SnapshotFetched
//! → Merged → Uploaded → LockReleased` and either finishes with a
//! [`SyncReport`] or stops with a [`SyncFailure`] naming the step that
//! failed and the ways the caller may resume.
//!
//! The watermark for the remote is advanced only after the lock marker has
//! been removed, so a failed attempt never moves it.

use crate::config::SyncConfig;
use crate::error::{SyncError, TransportResult};
use crate::remote::{LockInfo, Remote};
use serde::Serialize;
use stash_engine::{MergeReport, Store, Timestamp};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Steps of a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SyncState {
    Connecting,
    DirectoryReady,
    LockCheck,
    LockAcquired,
    SnapshotFetched,
    Merged,
    Uploaded,
    LockReleased,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Connecting => "connecting",
            SyncState::DirectoryReady => "directory-ready",
            SyncState::LockCheck => "lock-check",
            SyncState::LockAcquired => "lock-acquired",
            SyncState::SnapshotFetched => "snapshot-fetched",
            SyncState::Merged => "merged",
            SyncState::Uploaded => "uploaded",
            SyncState::LockReleased => "lock-released",
        };
        f.write_str(name)
    }
}

/// Ways to continue after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resumption {
    /// Start a fresh attempt with the same options.
    Retry,
    /// Start a fresh attempt that ignores an existing lock marker. Another
    /// client syncing at the same time may lose its changes.
    Force,
}

/// Options for one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Skip the lock-held check and write the marker anyway.
    pub force: bool,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Result of a successful attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub source: String,
    pub merge: MergeReport,
    /// New watermark for `source`
    pub merged_at: Timestamp,
    /// Whether the remote held no snapshot before this attempt
    pub remote_was_empty: bool,
    pub forced: bool,
    pub local_records: usize,
}

/// A failed attempt.
#[derive(Debug, thiserror::Error)]
#[error("sync failed at {state}: {error}")]
pub struct SyncFailure {
    /// The step that failed
    pub state: SyncState,
    #[source]
    pub error: SyncError,
    pub resumptions: Vec<Resumption>,
    /// The lock marker written by this attempt could not be removed.
    /// Clients will see the remote as locked until an operator removes it
    /// or someone forces a sync.
    pub lock_left_behind: bool,
}

impl SyncFailure {
    fn new(state: SyncState, error: SyncError) -> Self {
        let resumptions = match (&error, state) {
            (SyncError::LockHeld { .. }, _) => vec![Resumption::Retry, Resumption::Force],
            (_, SyncState::Merged) => vec![Resumption::Retry],
            _ => Vec::new(),
        };
        Self {
            state,
            error,
            resumptions,
            lock_left_behind: false,
        }
    }

    /// Fatal failures offer no resumption.
    pub fn is_fatal(&self) -> bool {
        self.resumptions.is_empty()
    }

    /// Options for resuming along `path`, if that path is offered.
    pub fn resume(&self, path: Resumption, previous: SyncOptions) -> Option<SyncOptions> {
        if !self.resumptions.contains(&path) {
            return None;
        }
        Some(match path {
            Resumption::Retry => previous,
            Resumption::Force => SyncOptions::forced(),
        })
    }
}

type Step<T> = Result<T, SyncFailure>;

/// Runs sync attempts for one local store against one remote.
pub struct SyncCoordinator<R> {
    store: Arc<Store>,
    remote: Arc<R>,
    config: SyncConfig,
}

impl<R: Remote + 'static> SyncCoordinator<R> {
    pub fn new(store: Arc<Store>, remote: Arc<R>, config: SyncConfig) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one attempt on its own task.
    pub fn spawn(
        self: &Arc<Self>,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<SyncReport, SyncFailure>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(options, cancel).await })
    }

    /// Run one attempt to a terminal state.
    pub async fn run(
        &self,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncFailure> {
        let span = tracing::info_span!(
            "sync",
            source = %self.config.source_id,
            force = options.force,
            holder = %self.config.holder,
        );

        async {
            let result = self.attempt(options, &cancel).await;
            self.remote.close().await;
            match &result {
                Ok(report) => tracing::info!(
                    merged_at = report.merged_at,
                    local_changed = report.merge.local_changed(),
                    remote_changed = report.merge.remote_changed(),
                    "sync finished"
                ),
                Err(failure) => tracing::warn!(
                    state = %failure.state,
                    error = %failure.error,
                    resumptions = ?failure.resumptions,
                    lock_left_behind = failure.lock_left_behind,
                    "sync failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, options: SyncOptions, cancel: &CancellationToken) -> Step<SyncReport> {
        let lock_name = self.config.lock_name.as_str();
        let snapshot_name = self.config.snapshot_name.as_str();

        let state = SyncState::Connecting;
        tracing::info!(%state);
        self.io(cancel, "open", self.remote.open())
            .await
            .map_err(|e| SyncFailure::new(state, e))?;
        tracing::info!(state = %SyncState::DirectoryReady);

        let state = SyncState::LockCheck;
        let entries = self
            .io(cancel, "list", self.remote.list_entries())
            .await
            .map_err(|e| SyncFailure::new(state, e))?;
        let locked = entries.contains(lock_name);
        tracing::info!(%state, locked, entries = entries.len());

        if locked {
            let holder = self.read_lock_info(cancel).await;
            if !options.force {
                if let Some(info) = &holder {
                    tracing::warn!(
                        holder = %info.holder,
                        age_secs = info.age(chrono::Utc::now()).num_seconds(),
                        "remote is locked"
                    );
                }
                return Err(SyncFailure::new(state, SyncError::LockHeld { holder }));
            }
            tracing::warn!(
                holder = holder.as_ref().map(|h| h.holder.as_str()).unwrap_or("unknown"),
                "forcing sync over an existing lock marker"
            );
        }

        let state = SyncState::LockAcquired;
        let marker = LockInfo::new(self.config.holder.clone()).to_bytes();
        self.io(cancel, "lock", self.remote.create_marker(lock_name, &marker))
            .await
            .map_err(|e| SyncFailure::new(state, e))?;
        tracing::info!(%state);

        // From here on the marker is ours and must be removed on every path.
        let merged = match self.exchange(cancel, &entries, snapshot_name).await {
            Ok(merged) => merged,
            Err(mut failure) => {
                failure.lock_left_behind = !self.release_after_failure(lock_name).await;
                return Err(failure);
            }
        };

        let state = SyncState::LockReleased;
        self.io_uncancellable("unlock", self.remote.delete_marker(lock_name))
            .await
            .map_err(|e| SyncFailure {
                lock_left_behind: true,
                ..SyncFailure::new(state, e)
            })?;
        tracing::info!(%state);

        // The marker is gone; record the merge instant as the new watermark.
        let source = self.config.source_id.clone();
        self.store
            .set_watermark(&source, merged.merged_at)
            .map_err(|e| SyncFailure::new(state, e.into()))?;
        self.commit_local()
            .await
            .map_err(|e| SyncFailure::new(state, e))?;

        Ok(SyncReport {
            source,
            merge: merged.report,
            merged_at: merged.merged_at,
            remote_was_empty: merged.remote_was_empty,
            forced: options.force,
            local_records: self.store.len(),
        })
    }

    /// Fetch, merge, persist and upload while holding the lock.
    async fn exchange(
        &self,
        cancel: &CancellationToken,
        entries: &std::collections::BTreeSet<String>,
        snapshot_name: &str,
    ) -> Step<Merged> {
        let state = SyncState::SnapshotFetched;
        let bytes = if entries.contains(snapshot_name) {
            self.io(cancel, "download", self.remote.download(snapshot_name))
                .await
                .map_err(|e| SyncFailure::new(state, e))?
        } else {
            None
        };
        tracing::info!(%state, bytes = bytes.as_ref().map_or(0, Vec::len));

        let state = SyncState::Merged;
        let merged = self
            .merge(bytes)
            .await
            .map_err(|e| SyncFailure::new(state, e))?;
        tracing::info!(
            %state,
            merged_at = merged.merged_at,
            from_remote = merged.report.field_changes.len(),
            added_to_local = merged.report.added_to_local.len(),
            added_to_remote = merged.report.added_to_remote.len(),
            deleted_from_local = merged.report.deleted_from_local.len(),
            deleted_from_remote = merged.report.deleted_from_remote.len(),
        );

        let state = SyncState::Uploaded;
        self.io(
            cancel,
            "upload",
            self.remote.upload(snapshot_name, merged.remote_text.as_bytes()),
        )
        .await
        .map_err(|e| SyncFailure::new(state, e))?;
        tracing::info!(%state);

        Ok(merged)
    }

    /// Materialize the remote store, merge it into the local one and commit
    /// the local side.
    async fn merge(&self, bytes: Option<Vec<u8>>) -> Result<Merged, SyncError> {
        let store = Arc::clone(&self.store);
        let source = self.config.source_id.clone();
        let path = self.config.db_path.clone();

        let merged = tokio::task::spawn_blocking(move || -> stash_engine::error::Result<Merged> {
            let schema = Arc::clone(store.schema());
            let remote_was_empty = bytes.is_none();
            let remote = match bytes {
                Some(bytes) => {
                    let text = String::from_utf8(bytes).map_err(|e| {
                        stash_engine::Error::unreadable(format!("remote snapshot: {e}"))
                    })?;
                    Store::decode(&text, schema)?
                }
                None => Store::new(schema),
            };

            if !store.has_sync_source(&source) {
                tracing::info!(%source, "registering new sync source");
                store.add_sync_source(source.clone());
            }

            let outcome = store.merge_with(&remote, &source)?;
            store.commit(&path)?;
            Ok(Merged {
                report: outcome.report,
                merged_at: outcome.merged_at,
                remote_text: remote.encode()?,
                remote_was_empty,
            })
        })
        .await
        .map_err(|e| SyncError::MergeFailed(stash_engine::Error::unreadable(e.to_string())))?;

        merged.map_err(SyncError::MergeFailed)
    }

    async fn commit_local(&self) -> Result<(), SyncError> {
        let store = Arc::clone(&self.store);
        let path = self.config.db_path.clone();
        tokio::task::spawn_blocking(move || store.commit(&path))
            .await
            .map_err(|e| {
                SyncError::Store(stash_engine::Error::StoreWrite {
                    path: self.config.db_path.display().to_string(),
                    reason: e.to_string(),
                })
            })??;
        Ok(())
    }

    async fn read_lock_info(&self, cancel: &CancellationToken) -> Option<LockInfo> {
        let lock_name = self.config.lock_name.as_str();
        match self.io(cancel, "read lock", self.remote.download(lock_name)).await {
            Ok(Some(bytes)) => LockInfo::from_bytes(&bytes),
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(error = %err, "lock marker unreadable");
                None
            }
        }
    }

    /// Remove our marker after a failed or cancelled step. Returns whether
    /// the marker is gone.
    async fn release_after_failure(&self, lock_name: &str) -> bool {
        match self
            .io_uncancellable("unlock", self.remote.delete_marker(lock_name))
            .await
        {
            Ok(()) => {
                tracing::info!(state = %SyncState::LockReleased, "lock released after failure");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "lock marker left on the remote");
                false
            }
        }
    }

    /// Bound a remote operation by the timeout and the attempt's token.
    async fn io<T>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        fut: impl Future<Output = TransportResult<T>>,
    ) -> Result<T, SyncError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.io_uncancellable(op, fut) => result,
        }
    }

    async fn io_uncancellable<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = TransportResult<T>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(result) => result.map_err(|e| SyncError::from_transport(op, e)),
            Err(_) => Err(SyncError::RemoteIo {
                op,
                reason: format!("timed out after {:?}", self.config.io_timeout),
            }),
        }
    }
}

struct Merged {
    report: MergeReport,
    merged_at: Timestamp,
    remote_text: String,
    remote_was_empty: bool,
}
