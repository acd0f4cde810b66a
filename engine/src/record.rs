//! Record types for storing data.

use crate::{error::Result, Field, FieldDef, RecordId, Schema, Timestamp, Value};
use std::sync::Arc;

/// A data record: an identified bundle of fields.
///
/// The id and creation time are fixed at construction. A record is built in
/// two phases: while under construction, field writes store values without
/// timestamping anything; once the owning store marks construction
/// finished (see [`Store::add`](crate::Store::add)), every write stamps the
/// field and the record.
#[derive(Debug, Clone)]
pub struct Record {
    id: RecordId,
    created_at: Timestamp,
    modified_at: Timestamp,
    schema: Arc<Schema>,
    /// One field per schema entry, same order
    fields: Vec<Field>,
    construction_finished: bool,
}

impl Record {
    /// Create a new record with every field at its zero value.
    pub fn new(schema: Arc<Schema>, id: impl Into<RecordId>, created_at: Timestamp) -> Self {
        Self::restored(schema, id, created_at, created_at)
    }

    /// Create a record with explicit creation and modification times, as
    /// read back from durable state.
    pub fn restored(
        schema: Arc<Schema>,
        id: impl Into<RecordId>,
        created_at: Timestamp,
        modified_at: Timestamp,
    ) -> Self {
        let fields = schema
            .fields()
            .iter()
            .map(|def| Field::new(def.field_type.zero()))
            .collect();
        Self {
            id: id.into(),
            created_at,
            modified_at,
            schema,
            fields,
            construction_finished: false,
        }
    }

    /// Builder-style initial value, written silently during construction.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self> {
        let index = self.schema.index_of(name)?;
        self.fields[index].set_silently(value.into());
        Ok(self)
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Timestamp of the most recent field write.
    pub fn modified_at(&self) -> Timestamp {
        self.modified_at
    }

    /// Prototype this record was built from.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Whether field writes are being timestamped yet.
    pub fn is_construction_finished(&self) -> bool {
        self.construction_finished
    }

    /// Value of a field.
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.field(name).map(Field::value)
    }

    /// A field with its timestamp.
    pub fn field(&self, name: &str) -> Result<&Field> {
        let index = self.schema.index_of(name)?;
        Ok(&self.fields[index])
    }

    /// Write a field.
    ///
    /// After construction the field is stamped `now` and the record takes
    /// the same timestamp. Returns the field's timestamp.
    pub fn set(&mut self, name: &str, value: impl Into<Value>, now: Timestamp) -> Result<Timestamp> {
        let index = self.schema.index_of(name)?;
        let field = &mut self.fields[index];
        if !self.construction_finished {
            field.set_silently(value.into());
            return Ok(field.modified_at());
        }

        field.set(value.into(), now);
        self.modified_at = field.modified_at();
        Ok(self.modified_at)
    }

    /// Iterate `(name, field)` pairs in prototype order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> + '_ {
        self.schema
            .fields()
            .iter()
            .zip(self.fields.iter())
            .map(|(def, field)| (def.name.as_str(), field))
    }

    /// Field definitions paired with fields, for codecs.
    pub(crate) fn defs_and_fields(&self) -> impl Iterator<Item = (&FieldDef, &Field)> + '_ {
        self.schema.fields().iter().zip(self.fields.iter())
    }

    /// Restore a field with its persisted timestamp. Construction only.
    pub(crate) fn restore_field(&mut self, name: &str, value: Value, modified_at: Timestamp) -> Result<()> {
        let index = self.schema.index_of(name)?;
        self.fields[index] = Field::restored(value, modified_at);
        Ok(())
    }

    /// Adopt another copy's field by position (merge only). Leaves the
    /// record's own modification time alone.
    pub(crate) fn adopt_field(&mut self, index: usize, donor: &Field) {
        self.fields[index].replace(donor);
    }

    /// Move the modification time forward to `at` (merge only).
    pub(crate) fn raise_modified_at(&mut self, at: Timestamp) {
        self.modified_at = self.modified_at.max(at);
    }

    pub(crate) fn field_at(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub(crate) fn finish_construction(&mut self) {
        self.construction_finished = true;
    }
}

/// Records compare by content; the construction flag is not part of it.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.created_at == other.created_at
            && self.modified_at == other.modified_at
            && self.schema == other.schema
            && self.fields == other.fields
    }
}
