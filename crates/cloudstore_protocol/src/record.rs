//! Remote records and their fields.

use crate::ids::{RecordId, ZoneId};
use cloudstore_codec::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The value of one record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// A transportable scalar.
    Scalar(Value),
    /// Reference to a single record (to-one relationship).
    Reference(RecordId),
    /// Ordered list of references (to-many relationship).
    ReferenceList(Vec<RecordId>),
}

impl FieldValue {
    /// Returns the scalar if this is `Scalar`.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the reference if this is `Reference`.
    pub fn as_reference(&self) -> Option<&RecordId> {
        match self {
            FieldValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the references if this is `ReferenceList`.
    pub fn as_reference_list(&self) -> Option<&[RecordId]> {
        match self {
            FieldValue::ReferenceList(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Scalar(v)
    }
}

/// A remote record: a flat map of named fields plus identity.
///
/// `change_tag` is assigned by the server on every save and must be echoed
/// back on the next save of the same record; a mismatch is a version
/// conflict. A record that was never saved has no tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Entity name the record represents.
    pub record_type: String,
    /// Record identity.
    pub record_id: RecordId,
    /// Server-assigned version marker.
    pub change_tag: Option<String>,
    /// Field values keyed by field name.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Creates an empty, never-saved record.
    pub fn new(record_type: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            record_type: record_type.into(),
            record_id,
            change_tag: None,
            fields: BTreeMap::new(),
        }
    }

    /// Returns the record name.
    pub fn record_name(&self) -> &str {
        &self.record_id.record_name
    }

    /// Returns the zone the record lives in.
    pub fn zone_id(&self) -> &ZoneId {
        &self.record_id.zone_id
    }

    /// Returns true if the server has confirmed this record at least once.
    pub fn is_saved(&self) -> bool {
        self.change_tag.is_some()
    }

    /// Gets a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Gets a scalar field.
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(FieldValue::as_scalar)
    }

    /// Sets a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Removes a field.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }
}
