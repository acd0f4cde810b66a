//! Timestamped scalar fields.

use crate::{error::Result, Error, FieldType, Timestamp};
use serde::{Deserialize, Serialize};

/// A scalar field value.
///
/// Writes are loosely typed: any kind may be stored in any field. The kind
/// written to disk is the kind of the value itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    /// Kind of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Str(_) => FieldType::Str,
            Value::Int(_) => FieldType::Int,
            Value::Float(_) => FieldType::Float,
            Value::Bool(_) => FieldType::Bool,
        }
    }

    /// Unescaped text form used by the durable file.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            // Display for f64 is the shortest form that parses back exactly.
            Value::Float(f) => f.to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
        }
    }

    /// Decode the text form of a value of the given kind.
    ///
    /// Booleans follow the historical rule: anything but `False` is true.
    pub fn from_text(kind: FieldType, text: &str) -> Result<Self> {
        match kind {
            FieldType::Str => Ok(Value::Str(text.to_string())),
            FieldType::Int => text
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| Error::unreadable(format!("invalid int value: {text:?}"))),
            FieldType::Float => text
                .trim()
                .parse()
                .map(Value::Float)
                .map_err(|_| Error::unreadable(format!("invalid float value: {text:?}"))),
            FieldType::Bool => Ok(Value::Bool(text != "False")),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A named record attribute together with the time it was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    value: Value,
    modified_at: Timestamp,
}

impl Field {
    /// A field holding `value`, never written (`modified_at == 0`).
    pub fn new(value: Value) -> Self {
        Self {
            value,
            modified_at: 0,
        }
    }

    /// A field restored from durable state with its original timestamp.
    pub fn restored(value: Value, modified_at: Timestamp) -> Self {
        Self { value, modified_at }
    }

    /// Current value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// When the value was last written.
    pub fn modified_at(&self) -> Timestamp {
        self.modified_at
    }

    /// Write a new value, stamped `now`.
    pub fn set(&mut self, value: Value, now: Timestamp) {
        self.value = value;
        self.modified_at = now;
    }

    /// Adopt another field's value and timestamp verbatim.
    pub fn replace(&mut self, other: &Field) {
        self.value = other.value.clone();
        self.modified_at = other.modified_at;
    }

    /// Write a value without touching the timestamp. Only valid while the
    /// owning record is still under construction.
    pub(crate) fn set_silently(&mut self, value: Value) {
        self.value = value;
    }
}
