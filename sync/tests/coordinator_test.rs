//! Integration tests for the sync coordinator.
//!
//! Most tests run against an in-memory remote that records every call and
//! can be told to fail or stall on a given operation.

use async_trait::async_trait;
use stash_engine::{Schema, Store, Value, NEVER_SYNCED};
use stash_sync::{
    FsRemote, LockInfo, RemoteCollection, RemoteLock, Resumption, SyncConfig, SyncCoordinator,
    SyncError, SyncFailure, SyncOptions, SyncReport, SyncState, TransportError, TransportResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SNAPSHOT: &str = ".task_db.xml";
const LOCK: &str = ".task-lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Open,
    List,
    Download,
    Upload,
    CreateMarker,
    DeleteMarker,
}

#[derive(Default)]
struct MemoryRemote {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<Op, TransportError>>,
    delays: Mutex<HashMap<Op, Duration>>,
    calls: Mutex<Vec<Op>>,
}

impl MemoryRemote {
    fn fail_on(&self, op: Op, err: TransportError) {
        self.failures.lock().unwrap().insert(op, err);
    }

    fn stall_on(&self, op: Op, delay: Duration) {
        self.delays.lock().unwrap().insert(op, delay);
    }

    fn put(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.entries.lock().unwrap().insert(name.to_string(), bytes.into());
    }

    fn entry(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    fn calls(&self) -> Vec<Op> {
        self.calls.lock().unwrap().clone()
    }

    fn snapshot_store(&self) -> Option<Store> {
        let bytes = self.entry(SNAPSHOT)?;
        Some(Store::decode(std::str::from_utf8(&bytes).unwrap(), Schema::tasks()).unwrap())
    }

    async fn enter(&self, op: Op) -> TransportResult<()> {
        self.calls.lock().unwrap().push(op);
        let delay = self.delays.lock().unwrap().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().get(&op).cloned();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteCollection for MemoryRemote {
    async fn open(&self) -> TransportResult<()> {
        self.enter(Op::Open).await
    }

    async fn list_entries(&self) -> TransportResult<BTreeSet<String>> {
        self.enter(Op::List).await?;
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    async fn download(&self, name: &str) -> TransportResult<Option<Vec<u8>>> {
        self.enter(Op::Download).await?;
        Ok(self.entry(name))
    }

    async fn upload(&self, name: &str, bytes: &[u8]) -> TransportResult<()> {
        self.enter(Op::Upload).await?;
        self.put(name, bytes);
        Ok(())
    }
}

#[async_trait]
impl RemoteLock for MemoryRemote {
    async fn create_marker(&self, name: &str, contents: &[u8]) -> TransportResult<()> {
        self.enter(Op::CreateMarker).await?;
        self.put(name, contents);
        Ok(())
    }

    async fn delete_marker(&self, name: &str) -> TransportResult<()> {
        self.enter(Op::DeleteMarker).await?;
        match self.entries.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(TransportError::Io(format!("{name} not found"))),
        }
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<Store>,
    remote: Arc<MemoryRemote>,
    coordinator: Arc<SyncCoordinator<MemoryRemote>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    fn with_timeout(io_timeout: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = SyncConfig::new(dir.path().join("local.xml"), "unused");
        config.holder = "test-client".to_string();
        config.io_timeout = io_timeout;

        let store = Arc::new(Store::new(Schema::tasks()));
        let remote = Arc::new(MemoryRemote::default());
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            config,
        ));
        Self {
            dir,
            store,
            remote,
            coordinator,
        }
    }

    fn add_task(&self, id: &str, title: &str) {
        let task = self.store.new_record(id).with("title", title).unwrap();
        self.store.add(task);
    }

    async fn sync(&self, options: SyncOptions) -> Result<SyncReport, SyncFailure> {
        self.coordinator.run(options, CancellationToken::new()).await
    }

    fn committed(&self) -> Store {
        Store::load(self.dir.path().join("local.xml"), Schema::tasks()).unwrap()
    }
}

fn remote_with_tasks(tasks: &[(&str, &str)]) -> String {
    let store = Store::new(Schema::tasks());
    for (id, title) in tasks {
        store.add(store.new_record(*id).with("title", *title).unwrap());
    }
    store.encode().unwrap()
}

// ============================================================================
// Successful attempts
// ============================================================================

mod success_tests {
    use super::*;

    #[tokio::test]
    async fn first_sync_pushes_local_records_to_empty_remote() {
        let h = Harness::new();
        h.add_task("t1", "water plants");
        h.add_task("t2", "call mum");

        let report = h.sync(SyncOptions::default()).await.unwrap();

        assert!(report.remote_was_empty);
        assert!(!report.forced);
        assert_eq!(report.merge.added_to_remote, vec!["t1", "t2"]);
        assert_eq!(report.local_records, 2);

        let remote = h.remote.snapshot_store().unwrap();
        assert_eq!(remote.ids(), vec!["t1", "t2"]);
        assert_eq!(
            remote.get("t1").unwrap().get("title").unwrap(),
            &Value::from("water plants")
        );
        assert!(h.remote.entry(LOCK).is_none());

        assert_eq!(
            h.remote.calls(),
            vec![
                Op::Open,
                Op::List,
                Op::CreateMarker,
                Op::Upload,
                Op::DeleteMarker
            ]
        );
    }

    #[tokio::test]
    async fn watermark_is_the_merge_instant_and_is_committed() {
        let h = Harness::new();
        h.add_task("t1", "water plants");

        let report = h.sync(SyncOptions::default()).await.unwrap();

        assert_eq!(h.store.watermark("remote").unwrap(), report.merged_at);
        assert!(!h.store.is_dirty());

        let committed = h.committed();
        assert_eq!(committed.watermark("remote").unwrap(), report.merged_at);
        assert_eq!(committed.ids(), vec!["t1"]);
    }

    #[tokio::test]
    async fn pulls_remote_records() {
        let h = Harness::new();
        h.remote
            .put(SNAPSHOT, remote_with_tasks(&[("r1", "from phone"), ("r2", "also phone")]));

        let report = h.sync(SyncOptions::default()).await.unwrap();

        assert!(!report.remote_was_empty);
        assert_eq!(report.merge.added_to_local, vec!["r1", "r2"]);
        assert_eq!(
            h.store.get("r2").unwrap().get("title").unwrap(),
            &Value::from("also phone")
        );
        assert_eq!(h.remote.calls()[3], Op::Download);
    }

    #[tokio::test]
    async fn deletion_on_remote_reaches_local_on_next_sync() {
        let h = Harness::new();
        h.add_task("keep", "keep me");
        h.add_task("drop", "drop me");
        h.sync(SyncOptions::default()).await.unwrap();

        // Another client removes a task.
        let remote = h.remote.snapshot_store().unwrap();
        remote.remove("drop").unwrap();
        h.remote.put(SNAPSHOT, remote.encode().unwrap());

        let report = h.sync(SyncOptions::default()).await.unwrap();

        assert_eq!(report.merge.deleted_from_local, vec!["drop"]);
        assert_eq!(h.store.ids(), vec!["keep"]);
        assert_eq!(h.committed().ids(), vec!["keep"]);
    }

    #[tokio::test]
    async fn field_edits_on_both_sides_are_combined() {
        let h = Harness::new();
        h.add_task("t1", "draft");
        h.sync(SyncOptions::default()).await.unwrap();

        let remote = h.remote.snapshot_store().unwrap();
        remote.set_field("t1", "comment", "edited elsewhere").unwrap();
        h.remote.put(SNAPSHOT, remote.encode().unwrap());
        // Separate clocks; keep the two record stamps apart.
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.store.set_field("t1", "done", true).unwrap();

        h.sync(SyncOptions::default()).await.unwrap();

        for store in [h.store.as_ref(), &h.remote.snapshot_store().unwrap()] {
            let task = store.get("t1").unwrap();
            assert_eq!(task.get("done").unwrap(), &Value::Bool(true));
            assert_eq!(task.get("comment").unwrap(), &Value::from("edited elsewhere"));
        }
    }

    #[tokio::test]
    async fn spawned_attempt_runs_to_completion() {
        let h = Harness::new();
        h.add_task("t1", "background");

        let report = h
            .coordinator
            .spawn(SyncOptions::default(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.source, "remote");
        assert!(h.remote.snapshot_store().unwrap().contains("t1"));
    }
}

// ============================================================================
// Lock contention
// ============================================================================

mod lock_tests {
    use super::*;

    #[tokio::test]
    async fn held_lock_offers_retry_and_force() {
        let h = Harness::new();
        h.add_task("t1", "local");
        let marker = LockInfo::new("other-client").to_bytes();
        h.remote.put(LOCK, marker.clone());

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();

        assert_eq!(failure.state, SyncState::LockCheck);
        assert_eq!(
            failure.resumptions,
            vec![Resumption::Retry, Resumption::Force]
        );
        match &failure.error {
            SyncError::LockHeld { holder: Some(info) } => assert_eq!(info.holder, "other-client"),
            other => panic!("expected LockHeld with holder, got {other:?}"),
        }

        // Nothing was touched.
        assert_eq!(h.remote.entry(LOCK), Some(marker));
        assert!(h.remote.entry(SNAPSHOT).is_none());
        assert!(!h.remote.calls().contains(&Op::CreateMarker));
        assert!(!h.store.has_sync_source("remote"));
    }

    #[tokio::test]
    async fn unreadable_marker_still_counts_as_held() {
        let h = Harness::new();
        h.remote.put(LOCK, "locked by hand");

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(failure.error, SyncError::LockHeld { holder: None }));
    }

    #[tokio::test]
    async fn force_acquires_the_lock_regardless() {
        let h = Harness::new();
        h.add_task("t1", "local");
        h.remote.put(LOCK, LockInfo::new("crashed-client").to_bytes());

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();
        let options = failure
            .resume(Resumption::Force, SyncOptions::default())
            .unwrap();
        let report = h.sync(options).await.unwrap();

        assert!(report.forced);
        assert!(h.remote.entry(LOCK).is_none());
        assert!(h.remote.snapshot_store().unwrap().contains("t1"));
    }

    #[tokio::test]
    async fn marker_names_this_client_while_held() {
        let h = Harness::new();
        h.remote.stall_on(Op::Upload, Duration::from_millis(200));

        let handle = h
            .coordinator
            .spawn(SyncOptions::default(), CancellationToken::new());
        while !h.remote.calls().contains(&Op::Upload) {
            tokio::task::yield_now().await;
        }

        let info = LockInfo::from_bytes(&h.remote.entry(LOCK).unwrap()).unwrap();
        assert_eq!(info.holder, "test-client");

        handle.await.unwrap().unwrap();
        assert!(h.remote.entry(LOCK).is_none());
    }
}

// ============================================================================
// Failures
// ============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_remote_is_fatal() {
        let h = Harness::new();
        h.remote
            .fail_on(Op::Open, TransportError::Unreachable("no route".into()));

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();

        assert_eq!(failure.state, SyncState::Connecting);
        assert!(matches!(failure.error, SyncError::RemoteUnreachable(_)));
        assert!(failure.is_fatal());
        assert_eq!(h.remote.calls(), vec![Op::Open]);
    }

    #[tokio::test]
    async fn missing_directory_is_fatal() {
        let h = Harness::new();
        h.remote
            .fail_on(Op::Open, TransportError::DirectoryMissing("/share".into()));

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();
        assert!(matches!(failure.error, SyncError::DirectoryMissing(_)));
        assert!(failure.is_fatal());
    }

    #[tokio::test]
    async fn lock_write_failure_is_fatal() {
        let h = Harness::new();
        h.remote
            .fail_on(Op::CreateMarker, TransportError::Io("read-only".into()));

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();

        assert_eq!(failure.state, SyncState::LockAcquired);
        assert!(failure.is_fatal());
        assert!(!failure.lock_left_behind);
        assert!(!h.remote.calls().contains(&Op::DeleteMarker));
    }

    #[tokio::test]
    async fn corrupt_snapshot_offers_retry_only() {
        let h = Harness::new();
        h.add_task("t1", "local");
        h.remote.put(SNAPSHOT, "<db><not-closed>");

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();

        assert_eq!(failure.state, SyncState::Merged);
        assert!(matches!(failure.error, SyncError::MergeFailed(_)));
        assert_eq!(failure.resumptions, vec![Resumption::Retry]);
        assert_eq!(failure.resume(Resumption::Force, SyncOptions::default()), None);

        // The lock is released and the remote keeps its snapshot.
        assert!(h.remote.entry(LOCK).is_none());
        assert!(!failure.lock_left_behind);
        assert_eq!(h.remote.entry(SNAPSHOT), Some(b"<db><not-closed>".to_vec()));
        assert!(!h.remote.calls().contains(&Op::Upload));
    }

    #[tokio::test]
    async fn upload_failure_is_fatal_and_keeps_watermark() {
        let h = Harness::new();
        h.add_task("t1", "local");
        h.store.add_sync_source("remote");
        h.store.set_watermark("remote", 5).unwrap();
        h.remote
            .fail_on(Op::Upload, TransportError::Io("quota exceeded".into()));

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();

        assert_eq!(failure.state, SyncState::Uploaded);
        assert!(failure.is_fatal());
        match &failure.error {
            SyncError::RemoteIo { op, reason } => {
                assert_eq!(*op, "upload");
                assert_eq!(reason, "quota exceeded");
            }
            other => panic!("expected RemoteIo, got {other:?}"),
        }
        assert_eq!(h.store.watermark("remote").unwrap(), 5);
        assert!(h.remote.entry(LOCK).is_none());
    }

    #[tokio::test]
    async fn release_failure_leaves_marker_and_watermark() {
        let h = Harness::new();
        h.add_task("t1", "local");
        h.remote
            .fail_on(Op::DeleteMarker, TransportError::Io("permission denied".into()));

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();

        assert_eq!(failure.state, SyncState::LockReleased);
        assert!(failure.is_fatal());
        assert!(failure.lock_left_behind);
        assert!(h.remote.entry(LOCK).is_some());
        // The merge itself went through.
        assert!(h.remote.snapshot_store().unwrap().contains("t1"));
        assert_eq!(h.store.watermark("remote").unwrap(), NEVER_SYNCED);
    }

    #[tokio::test]
    async fn slow_operation_times_out() {
        let h = Harness::with_timeout(Duration::from_millis(50));
        h.remote.stall_on(Op::List, Duration::from_secs(30));

        let failure = h.sync(SyncOptions::default()).await.unwrap_err();

        assert_eq!(failure.state, SyncState::LockCheck);
        assert!(matches!(
            failure.error,
            SyncError::RemoteIo { op: "list", .. }
        ));
        assert!(failure.is_fatal());
    }
}

// ============================================================================
// Cancellation
// ============================================================================

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_before_connecting() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = h
            .coordinator
            .run(SyncOptions::default(), cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.state, SyncState::Connecting);
        assert!(matches!(failure.error, SyncError::Cancelled));
        assert!(h.remote.calls().is_empty() || h.remote.calls() == vec![Op::Open]);
    }

    #[tokio::test]
    async fn cancellation_after_lock_still_releases_it() {
        let h = Harness::new();
        h.add_task("t1", "local");
        h.remote.put(SNAPSHOT, remote_with_tasks(&[("r1", "remote")]));
        h.remote.stall_on(Op::Download, Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let handle = h.coordinator.spawn(SyncOptions::default(), cancel.clone());
        while !h.remote.calls().contains(&Op::Download) {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let failure = handle.await.unwrap().unwrap_err();

        assert_eq!(failure.state, SyncState::SnapshotFetched);
        assert!(matches!(failure.error, SyncError::Cancelled));
        assert!(!failure.lock_left_behind);
        assert_eq!(h.remote.calls().last(), Some(&Op::DeleteMarker));
        assert!(h.remote.entry(LOCK).is_none());
        assert!(!h.store.contains("r1"));
    }
}

// ============================================================================
// Directory transport
// ============================================================================

mod fs_remote_tests {
    use super::*;

    fn client(share: &std::path::Path, home: &TempDir, holder: &str) -> SyncCoordinator<FsRemote> {
        let mut config = SyncConfig::new(home.path().join("tasks.xml"), share);
        config.holder = holder.to_string();
        let store = Arc::new(Store::load(&config.db_path, Schema::tasks()).unwrap());
        SyncCoordinator::new(store, Arc::new(FsRemote::new(share)), config)
    }

    #[tokio::test]
    async fn two_clients_converge_through_a_shared_directory() {
        let share = TempDir::new().unwrap();
        let laptop_home = TempDir::new().unwrap();
        let desktop_home = TempDir::new().unwrap();

        let laptop = client(share.path(), &laptop_home, "laptop");
        let desktop = client(share.path(), &desktop_home, "desktop");

        let task = laptop.store().new_record("t1").with("title", "shared").unwrap();
        laptop.store().add(task);
        laptop
            .run(SyncOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        desktop
            .run(SyncOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            desktop.store().get("t1").unwrap().get("title").unwrap(),
            &Value::from("shared")
        );

        desktop.store().set_field("t1", "done", true).unwrap();
        desktop
            .run(SyncOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        laptop
            .run(SyncOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            laptop.store().get("t1").unwrap().get("done").unwrap(),
            &Value::Bool(true)
        );

        let mut names: Vec<_> = std::fs::read_dir(share.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec![SNAPSHOT]);

        // The laptop's reloaded store carries the same state.
        let reloaded = Store::load(laptop_home.path().join("tasks.xml"), Schema::tasks()).unwrap();
        assert_eq!(reloaded.snapshot(), laptop.store().snapshot());
    }
}
