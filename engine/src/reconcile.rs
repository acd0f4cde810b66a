//! Reconciliation of a local and a remote record set.
//!
//! # Algorithm
//!
//! 1. Partition ids into: present on both sides, local only, remote only
//! 2. For records on both sides whose modification times differ, compare
//!    every field; the copy with the strictly newer timestamp overwrites the
//!    other (value and timestamp). Equal timestamps are left alone.
//! 3. A record present on one side only is judged against the watermark:
//!    modified after it means created since the last sync (copy it over),
//!    modified before it means deleted on the other side (delete it here),
//!    modified exactly at the watermark is kept where it is.
//! 4. Deletions run after every other decision has been made.

use crate::{Record, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Records keyed by id, as held by a store snapshot.
pub type RecordMap = BTreeMap<RecordId, Record>;

/// Which side of a merge something came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Local,
    Remote,
}

/// A field copied from one side to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub record_id: RecordId,
    pub field: String,
    /// Side whose copy won
    pub winner: Side,
    /// Timestamp both copies carry afterwards
    pub modified_at: Timestamp,
}

/// What a merge changed on each side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Field-level overwrites, in record then field order
    pub field_changes: Vec<FieldChange>,
    /// Records created remotely since the last sync
    pub added_to_local: Vec<RecordId>,
    /// Records created locally since the last sync
    pub added_to_remote: Vec<RecordId>,
    /// Records deleted remotely since the last sync
    pub deleted_from_local: Vec<RecordId>,
    /// Records deleted locally since the last sync
    pub deleted_from_remote: Vec<RecordId>,
    /// One-sided records modified exactly at the watermark, left in place
    pub kept_at_watermark: Vec<(Side, RecordId)>,
}

impl MergeReport {
    /// Whether the local side was modified.
    pub fn local_changed(&self) -> bool {
        !self.added_to_local.is_empty()
            || !self.deleted_from_local.is_empty()
            || self.field_changes.iter().any(|c| c.winner == Side::Remote)
    }

    /// Whether the remote side was modified.
    pub fn remote_changed(&self) -> bool {
        !self.added_to_remote.is_empty()
            || !self.deleted_from_remote.is_empty()
            || self.field_changes.iter().any(|c| c.winner == Side::Local)
    }

    /// Whether the merge changed nothing at all.
    pub fn is_noop(&self) -> bool {
        !self.local_changed() && !self.remote_changed()
    }
}

/// Fate of a record that only one side has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OneSided {
    Propagate,
    Delete,
    Keep,
}

fn classify(modified_at: Timestamp, last_sync: Timestamp) -> OneSided {
    match modified_at.cmp(&last_sync) {
        Ordering::Greater => OneSided::Propagate,
        Ordering::Less => OneSided::Delete,
        Ordering::Equal => OneSided::Keep,
    }
}

/// Merge two record sets in place.
///
/// `last_sync` is the watermark of the previous successful sync between
/// these two sides ([`NEVER_SYNCED`](crate::NEVER_SYNCED) if none).
pub fn merge(local: &mut RecordMap, remote: &mut RecordMap, last_sync: Timestamp) -> MergeReport {
    let mut report = MergeReport::default();

    let in_both: Vec<RecordId> = local
        .keys()
        .filter(|id| remote.contains_key(*id))
        .cloned()
        .collect();
    let local_only: Vec<RecordId> = local
        .keys()
        .filter(|id| !remote.contains_key(*id))
        .cloned()
        .collect();
    let remote_only: Vec<RecordId> = remote
        .keys()
        .filter(|id| !local.contains_key(*id))
        .cloned()
        .collect();

    for id in &in_both {
        if let (Some(ours), Some(theirs)) = (local.get_mut(id), remote.get_mut(id)) {
            if ours.modified_at() != theirs.modified_at() {
                resolve_fields(ours, theirs, &mut report);
            }
        }
    }

    // Decide everything first; the id sets must not shift underneath us.
    let mut local_delete = Vec::new();
    for id in local_only {
        let Some(record) = local.get(&id) else { continue };
        match classify(record.modified_at(), last_sync) {
            OneSided::Propagate => {
                remote.insert(id.clone(), record.clone());
                report.added_to_remote.push(id);
            }
            OneSided::Delete => local_delete.push(id),
            OneSided::Keep => report.kept_at_watermark.push((Side::Local, id)),
        }
    }

    let mut remote_delete = Vec::new();
    for id in remote_only {
        let Some(record) = remote.get(&id) else { continue };
        match classify(record.modified_at(), last_sync) {
            OneSided::Propagate => {
                local.insert(id.clone(), record.clone());
                report.added_to_local.push(id);
            }
            OneSided::Delete => remote_delete.push(id),
            OneSided::Keep => report.kept_at_watermark.push((Side::Remote, id)),
        }
    }

    for id in local_delete {
        local.remove(&id);
        report.deleted_from_local.push(id);
    }
    for id in remote_delete {
        remote.remove(&id);
        report.deleted_from_remote.push(id);
    }

    report
}

/// Last-writer-wins per field. Fields are matched by name.
///
/// When any field moved, both copies end up with the later of the two
/// record stamps so a third copy holding the older stamp still sees them as
/// changed.
fn resolve_fields(local: &mut Record, remote: &mut Record, report: &mut MergeReport) {
    let schema = Arc::clone(local.schema());
    let before = report.field_changes.len();
    for (local_index, def) in schema.fields().iter().enumerate() {
        let Ok(remote_index) = remote.schema().index_of(&def.name) else {
            continue;
        };
        let ours = local.field_at(local_index);
        let theirs = remote.field_at(remote_index);

        let winner = match ours.modified_at().cmp(&theirs.modified_at()) {
            Ordering::Greater => {
                let donor = ours.clone();
                remote.adopt_field(remote_index, &donor);
                Side::Local
            }
            Ordering::Less => {
                let donor = theirs.clone();
                local.adopt_field(local_index, &donor);
                Side::Remote
            }
            Ordering::Equal => continue,
        };

        report.field_changes.push(FieldChange {
            record_id: local.id().clone(),
            field: def.name.clone(),
            winner,
            modified_at: local.field_at(local_index).modified_at(),
        });
    }

    if report.field_changes.len() > before {
        let stamp = local.modified_at().max(remote.modified_at());
        local.raise_modified_at(stamp);
        remote.raise_modified_at(stamp);
    }
}
