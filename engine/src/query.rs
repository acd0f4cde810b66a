//! Materialized query results.

use crate::{Record, RecordId};
use std::cmp::Ordering;
use std::collections::HashMap;

/// An ordered, owned snapshot of records matching a query.
///
/// Results are copies: later changes to the store do not show up here.
/// A result can itself be queried again.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    records: Vec<Record>,
    positions: HashMap<RecordId, usize>,
}

impl QueryResult {
    /// Filter, then stable-sort by `compare`.
    pub(crate) fn build<'a, P, C>(records: impl Iterator<Item = &'a Record>, predicate: P, compare: C) -> Self
    where
        P: Fn(&Record) -> bool,
        C: Fn(&Record, &Record) -> Ordering,
    {
        let mut records: Vec<Record> = records.filter(|r| predicate(r)).cloned().collect();
        records.sort_by(|a, b| compare(a, b));
        let positions = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id().clone(), i))
            .collect();
        Self { records, positions }
    }

    /// Query this result again.
    pub fn query<P, C>(&self, predicate: P, compare: C) -> QueryResult
    where
        P: Fn(&Record) -> bool,
        C: Fn(&Record, &Record) -> Ordering,
    {
        Self::build(self.records.iter(), predicate, compare)
    }

    /// Whether a record with this id is in the result.
    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Look up a record by id.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.positions.get(id).map(|&i| &self.records[i])
    }

    /// Record at a position in sort order.
    pub fn at(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Ids in sort order.
    pub fn ids(&self) -> Vec<&RecordId> {
        self.records.iter().map(Record::id).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl IntoIterator for QueryResult {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Predicate that accepts every record.
pub fn all(_: &Record) -> bool {
    true
}

/// Comparator that keeps the incoming order.
pub fn unordered(_: &Record, _: &Record) -> Ordering {
    Ordering::Equal
}
