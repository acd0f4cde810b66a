//! Snapshot types for persisting and restoring store state.
//!
//! A [`StoreSnapshot`] is everything that goes into the durable file: the
//! format version, the sync-source watermarks and the records. It is the
//! single model both XML dialects encode.

use crate::{Record, RecordId, Timestamp};
use std::collections::BTreeMap;

/// Version tag written into every durable file.
pub const SNAPSHOT_FORMAT_VERSION: &str = "beta1";

/// Watermark of a sync source that has never completed a sync.
pub const NEVER_SYNCED: Timestamp = -1;

/// A point-in-time image of the store.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: String,
    /// Last successful sync per remote identity
    pub sync_sources: BTreeMap<String, Timestamp>,
    /// All records by id
    pub records: BTreeMap<RecordId, Record>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            sync_sources: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    /// Add or replace a record.
    pub fn add_record(&mut self, record: Record) {
        self.records.insert(record.id().clone(), record);
    }

    /// Get a record.
    pub fn get_record(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Count records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
