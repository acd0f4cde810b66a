//! Store - the in-memory state container.
//!
//! The Store holds every record plus the per-remote sync watermarks. It is
//! safe to share between threads: all reads and writes go through a single
//! mutex, and readers always receive owned copies.

use crate::{
    codec::{self, Dialect},
    error::Result,
    reconcile::{self, MergeReport},
    Clock, Error, QueryResult, Record, RecordId, Schema, StoreSnapshot, SystemClock, Timestamp,
    Value, NEVER_SYNCED,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    snapshot: StoreSnapshot,
    dialect: Dialect,
    /// Set by every mutation, cleared by commit
    dirty: bool,
}

/// Result of merging a store with a remote copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// What changed on each side
    pub report: MergeReport,
    /// Clock reading taken while both stores were locked; the watermark to
    /// record once the merged state has been safely published
    pub merged_at: Timestamp,
}

/// The main store holding all state.
#[derive(Debug)]
pub struct Store {
    /// Prototype for every record
    schema: Arc<Schema>,
    /// Source of field timestamps
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Store {
    /// Create an empty store using the compact dialect.
    pub fn new(schema: impl Into<Arc<Schema>>) -> Self {
        Self::from_snapshot(schema.into(), StoreSnapshot::new(), Dialect::default())
    }

    fn from_snapshot(schema: Arc<Schema>, snapshot: StoreSnapshot, dialect: Dialect) -> Self {
        Self {
            schema,
            clock: Arc::new(SystemClock::new()),
            inner: Mutex::new(Inner {
                snapshot,
                dialect,
                dirty: false,
            }),
        }
    }

    /// Replace the clock used for field timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load a store from disk.
    ///
    /// A missing file yields an empty store. Anything unreadable fails the
    /// whole load; no partial state is kept.
    pub fn load(path: impl AsRef<Path>, schema: impl Into<Arc<Schema>>) -> Result<Self> {
        let path = path.as_ref();
        let schema = schema.into();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no store file, starting empty");
            return Ok(Self::new(schema));
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::unreadable(e.to_string()).at_path(path))?;
        let store = Self::decode(&text, schema).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "rejected store file");
            e.at_path(path)
        })?;

        tracing::debug!(
            path = %path.display(),
            dialect = %store.dialect(),
            records = store.len(),
            "loaded store"
        );
        Ok(store)
    }

    /// Build a store from the text of a durable file.
    pub fn decode(text: &str, schema: impl Into<Arc<Schema>>) -> Result<Self> {
        let schema = schema.into();
        let (snapshot, dialect) = codec::decode(text, &schema)?;
        Ok(Self::from_snapshot(schema, snapshot, dialect))
    }

    /// Serialize the whole store in its dialect.
    pub fn encode(&self) -> Result<String> {
        let inner = self.inner.lock();
        codec::encode(&inner.snapshot, inner.dialect)
    }

    /// Write the whole store to `path`, atomically replacing any existing
    /// file.
    pub fn commit(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut inner = self.inner.lock();
        let write_err = |reason: String| Error::StoreWrite {
            path: path.display().to_string(),
            reason,
        };

        let text = codec::encode(&inner.snapshot, inner.dialect).map_err(|e| write_err(e.to_string()))?;
        write_atomic(path, text.as_bytes()).map_err(|e| write_err(e.to_string()))?;
        inner.dirty = false;

        tracing::debug!(
            path = %path.display(),
            dialect = %inner.dialect,
            records = inner.snapshot.record_count(),
            bytes = text.len(),
            "committed store"
        );
        Ok(())
    }

    /// The prototype shared by every record.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Read the store clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// A fresh record under construction, created now.
    ///
    /// Set its initial values, then hand it to [`Store::add`].
    pub fn new_record(&self, id: impl Into<RecordId>) -> Record {
        Record::new(self.schema.clone(), id, self.clock.now())
    }

    /// Insert or overwrite a record by id. From here on, writes to the
    /// record are timestamped.
    pub fn add(&self, mut record: Record) {
        record.finish_construction();
        let mut inner = self.inner.lock();
        inner.snapshot.add_record(record);
        inner.dirty = true;
    }

    /// Remove a record.
    pub fn remove(&self, id: &str) -> Result<Record> {
        let mut inner = self.inner.lock();
        let record = inner
            .snapshot
            .records
            .remove(id)
            .ok_or_else(|| Error::UnknownRecord(id.to_string()))?;
        inner.dirty = true;
        Ok(record)
    }

    /// Get a copy of a record.
    pub fn get(&self, id: &str) -> Result<Record> {
        self.inner
            .lock()
            .snapshot
            .get_record(id)
            .cloned()
            .ok_or_else(|| Error::UnknownRecord(id.to_string()))
    }

    /// Write one field of a stored record, stamped with the store clock.
    /// Returns the new field timestamp.
    ///
    /// The stamp is always above the record's current one, so a record that
    /// arrived from a clock running ahead still moves forward.
    pub fn set_field(&self, id: &str, name: &str, value: impl Into<Value>) -> Result<Timestamp> {
        let mut inner = self.inner.lock();
        let record = inner
            .snapshot
            .records
            .get_mut(id)
            .ok_or_else(|| Error::UnknownRecord(id.to_string()))?;
        let now = self.clock.now().max(record.modified_at() + 1);
        let stamped = record.set(name, value, now)?;
        inner.dirty = true;
        Ok(stamped)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().snapshot.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().snapshot.record_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All record ids, sorted.
    pub fn ids(&self) -> Vec<RecordId> {
        self.inner.lock().snapshot.records.keys().cloned().collect()
    }

    /// Filter records, then stable-sort them. The result is a snapshot.
    pub fn query<P, C>(&self, predicate: P, compare: C) -> QueryResult
    where
        P: Fn(&Record) -> bool,
        C: Fn(&Record, &Record) -> Ordering,
    {
        let inner = self.inner.lock();
        QueryResult::build(inner.snapshot.records.values(), predicate, compare)
    }

    /// A point-in-time copy of the whole store.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.lock().snapshot.clone()
    }

    /// Dialect used by [`Store::commit`].
    pub fn dialect(&self) -> Dialect {
        self.inner.lock().dialect
    }

    pub fn set_dialect(&self, dialect: Dialect) {
        let mut inner = self.inner.lock();
        if inner.dialect != dialect {
            inner.dialect = dialect;
            inner.dirty = true;
        }
    }

    /// Whether anything changed since the last load or commit.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    // ------------------------------------------------------------------
    // Sync sources
    // ------------------------------------------------------------------

    pub fn has_sync_source(&self, id: &str) -> bool {
        self.inner.lock().snapshot.sync_sources.contains_key(id)
    }

    /// Register a sync source as never synced. Re-adding resets it.
    pub fn add_sync_source(&self, id: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.snapshot.sync_sources.insert(id.into(), NEVER_SYNCED);
        inner.dirty = true;
    }

    pub fn remove_sync_source(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .snapshot
            .sync_sources
            .remove(id)
            .ok_or_else(|| Error::UnknownSyncSource(id.to_string()))?;
        inner.dirty = true;
        Ok(())
    }

    /// Last successful sync with a source.
    pub fn watermark(&self, id: &str) -> Result<Timestamp> {
        self.inner
            .lock()
            .snapshot
            .sync_sources
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownSyncSource(id.to_string()))
    }

    /// Record a successful sync.
    pub fn set_watermark(&self, id: &str, at: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .snapshot
            .sync_sources
            .get_mut(id)
            .ok_or_else(|| Error::UnknownSyncSource(id.to_string()))?;
        *slot = at;
        inner.dirty = true;
        Ok(())
    }

    /// All watermarks.
    pub fn sync_sources(&self) -> BTreeMap<String, Timestamp> {
        self.inner.lock().snapshot.sync_sources.clone()
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    /// Merge this (local) store with a remote copy, in place on both.
    ///
    /// Both stores stay locked for the whole merge, so concurrent edits land
    /// entirely before or entirely after it. The watermark is not advanced;
    /// see [`Store::sync`] for that.
    pub fn merge_with(&self, remote: &Store, source: &str) -> Result<MergeOutcome> {
        if std::ptr::eq(self, remote) {
            self.watermark(source)?;
            return Ok(MergeOutcome {
                report: MergeReport::default(),
                merged_at: self.clock.now(),
            });
        }
        if self.schema != remote.schema {
            return Err(Error::InvalidSchema(format!(
                "cannot merge {:?} records with {:?} records",
                self.schema.name, remote.schema.name
            )));
        }

        // Lock in address order, whichever side is local.
        let (mut local, mut theirs) = if (self as *const Store) < (remote as *const Store) {
            let local = self.inner.lock();
            (local, remote.inner.lock())
        } else {
            let theirs = remote.inner.lock();
            (self.inner.lock(), theirs)
        };

        let last_sync = local
            .snapshot
            .sync_sources
            .get(source)
            .copied()
            .ok_or_else(|| Error::UnknownSyncSource(source.to_string()))?;
        let merged_at = self.clock.now();

        let report = reconcile::merge(
            &mut local.snapshot.records,
            &mut theirs.snapshot.records,
            last_sync,
        );
        // Any field change may also move record stamps on both sides.
        let touched = !report.field_changes.is_empty();
        if touched || report.local_changed() {
            local.dirty = true;
        }
        if touched || report.remote_changed() {
            theirs.dirty = true;
        }

        tracing::debug!(
            source,
            last_sync,
            merged_at,
            fields = report.field_changes.len(),
            added_local = report.added_to_local.len(),
            added_remote = report.added_to_remote.len(),
            deleted_local = report.deleted_from_local.len(),
            deleted_remote = report.deleted_from_remote.len(),
            kept = report.kept_at_watermark.len(),
            "merged stores"
        );

        Ok(MergeOutcome { report, merged_at })
    }

    /// Merge with a remote copy and advance the source watermark.
    pub fn sync(&self, remote: &Store, source: &str) -> Result<MergeReport> {
        let outcome = self.merge_with(remote, source)?;
        self.set_watermark(source, outcome.merged_at)?;
        Ok(outcome.report)
    }
}

/// Write through a temp file in the destination directory, then rename.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
