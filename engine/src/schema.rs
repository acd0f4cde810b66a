//! Record prototypes.
//!
//! A [`Schema`] declares the fixed, ordered set of field names every record
//! of a store carries, and the scalar kind each field starts out as.

use crate::{error::Result, Error, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Scalar kinds a field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
}

impl FieldType {
    /// Tag written to the durable file.
    pub fn tag(self) -> &'static str {
        match self {
            FieldType::Str => "str",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
        }
    }

    /// Parse a durable tag. `unicode` is an alias for `str`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "str" | "unicode" => Some(FieldType::Str),
            "int" => Some(FieldType::Int),
            "float" => Some(FieldType::Float),
            "bool" => Some(FieldType::Bool),
            _ => None,
        }
    }

    /// Value a field of this kind holds before anything is written.
    pub fn zero(self) -> Value {
        match self {
            FieldType::Str => Value::Str(String::new()),
            FieldType::Int => Value::Int(0),
            FieldType::Float => Value::Float(0.0),
            FieldType::Bool => Value::Bool(false),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Definition of a field in a prototype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Kind of the zero value
    pub field_type: FieldType,
}

impl FieldDef {
    /// Create a new field definition.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Prototype shared by every record of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Human-readable prototype name
    pub name: String,
    /// Field definitions, in declaration order
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Create a prototype. Field names must be unique and non-empty.
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Result<Self> {
        let schema = Self {
            name: name.into(),
            fields,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// The task-list prototype: title, done flag, due date (-1 for none)
    /// and a free-form comment.
    pub fn tasks() -> Self {
        Self {
            name: "task".into(),
            fields: vec![
                FieldDef::new("title", FieldType::Str),
                FieldDef::new("done", FieldType::Bool),
                FieldDef::new("date", FieldType::Int),
                FieldDef::new("comment", FieldType::Str),
            ],
        }
    }

    /// Load a prototype from its JSON description.
    pub fn from_json(json: &str) -> Result<Self> {
        let schema: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSchema(e.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(Error::InvalidSchema("empty field name".into()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "duplicate field: {}",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Field definitions in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Position of a field, or `UnknownField`.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| Error::UnknownField(name.to_string()))
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the prototype declares no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
