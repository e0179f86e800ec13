//! Rows stored in the backing cache.

use cloudstore_codec::Value;
use cloudstore_protocol::{ChangeToken, Record, RecordId, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of an entity row, unique within one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

/// Sync state of one remote record.
///
/// `version` is the local dirty counter: it increments on every local
/// save and is `0` for a record whose entity was deleted locally.
/// `cached_record_version` is the last version the remote store confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Record identity.
    pub record_id: RecordId,
    /// Entity name.
    pub record_type: String,
    /// Local dirty counter.
    pub version: u64,
    /// Last confirmed version.
    pub cached_record_version: u64,
    /// Last known remote snapshot; the diff baseline.
    pub cached_remote: Record,
    /// Baseline from before a version conflict, kept for a three-way merge.
    pub merge_ancestor: Option<Record>,
    /// Companion entity row, `None` once the entity is deleted.
    pub row: Option<RowId>,
    /// Set while the row is a blank stand-in for a referenced record that
    /// has not arrived yet. Placeholders are never pushed.
    #[serde(default)]
    pub placeholder: bool,
}

impl LocalRecord {
    /// Creates the sync state for a record created locally.
    ///
    /// The baseline is an empty, never-saved record.
    pub fn created_locally(record_type: impl Into<String>, record_id: RecordId, row: RowId) -> Self {
        let record_type = record_type.into();
        Self {
            cached_remote: Record::new(record_type.clone(), record_id.clone()),
            record_id,
            record_type,
            version: 0,
            cached_record_version: 0,
            merge_ancestor: None,
            row: Some(row),
            placeholder: false,
        }
    }

    /// Creates the sync state for a record received from the remote store.
    ///
    /// The record starts clean: `version == cached_record_version`.
    pub fn from_remote(record: Record, row: RowId) -> Self {
        Self {
            record_id: record.record_id.clone(),
            record_type: record.record_type.clone(),
            version: 1,
            cached_record_version: 1,
            cached_remote: record,
            merge_ancestor: None,
            row: Some(row),
            placeholder: false,
        }
    }

    /// Creates the sync state for a blank row standing in for a referenced
    /// record the remote store has not delivered yet.
    pub fn placeholder(record_type: impl Into<String>, record_id: RecordId, row: RowId) -> Self {
        let record_type = record_type.into();
        Self {
            cached_remote: Record::new(record_type.clone(), record_id.clone()),
            record_id,
            record_type,
            version: 1,
            cached_record_version: 1,
            merge_ancestor: None,
            row: Some(row),
            placeholder: true,
        }
    }

    /// Returns the record name.
    pub fn record_name(&self) -> &str {
        &self.record_id.record_name
    }

    /// Returns true if local state has not been confirmed by the remote store.
    pub fn is_dirty(&self) -> bool {
        self.version > self.cached_record_version || self.version == 0
    }

    /// Returns true if the entity was deleted locally and the deletion is
    /// not yet pushed.
    pub fn is_tombstone(&self) -> bool {
        self.version == 0 && self.row.is_none()
    }

    /// Returns true if the remote store has ever confirmed this record.
    pub fn was_confirmed(&self) -> bool {
        self.cached_record_version > 0
    }
}

/// Value of a relationship on an entity row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationValue {
    /// To-one relationship.
    ToOne(Option<RowId>),
    /// To-many relationship; order is meaningful only for ordered ones.
    ToMany(Vec<RowId>),
}

impl RelationValue {
    /// Returns every referenced row.
    pub fn targets(&self) -> Vec<RowId> {
        match self {
            RelationValue::ToOne(target) => target.iter().copied().collect(),
            RelationValue::ToMany(targets) => targets.clone(),
        }
    }

    /// Returns true if `row` is referenced.
    pub fn contains(&self, row: RowId) -> bool {
        match self {
            RelationValue::ToOne(target) => *target == Some(row),
            RelationValue::ToMany(targets) => targets.contains(&row),
        }
    }

    /// Removes every reference to `row`; returns true if anything changed.
    pub fn remove(&mut self, row: RowId) -> bool {
        match self {
            RelationValue::ToOne(target) if *target == Some(row) => {
                *target = None;
                true
            }
            RelationValue::ToOne(_) => false,
            RelationValue::ToMany(targets) => {
                let before = targets.len();
                targets.retain(|t| *t != row);
                targets.len() != before
            }
        }
    }
}

/// One domain entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    /// Row identity.
    pub row_id: RowId,
    /// Entity name.
    pub entity: String,
    /// Name of the owning local record.
    pub record_name: String,
    /// Attribute values by name; absent means null.
    pub attributes: BTreeMap<String, Value>,
    /// Relationship values by name.
    pub relationships: BTreeMap<String, RelationValue>,
}

impl EntityRow {
    /// Creates an empty row.
    pub fn new(row_id: RowId, entity: impl Into<String>, record_name: impl Into<String>) -> Self {
        Self {
            row_id,
            entity: entity.into(),
            record_name: record_name.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    /// Returns an attribute, `Value::Null` if unset.
    pub fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&Value::Null)
    }

    /// Sets an attribute; `Null` clears it.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if value.is_null() {
            self.attributes.remove(&name);
        } else {
            self.attributes.insert(name, value);
        }
    }

    /// Returns a relationship value.
    pub fn relationship(&self, name: &str) -> Option<&RelationValue> {
        self.relationships.get(name)
    }
}

/// Per-store sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Stable store identity, generated once.
    pub uuid: Uuid,
    /// Zone this store mirrors.
    pub zone_id: ZoneId,
    /// Position in the zone change feed; `None` before the first pull.
    pub change_token: Option<ChangeToken>,
}

impl SyncMetadata {
    /// Creates metadata for a fresh store.
    pub fn new(zone_id: ZoneId) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            zone_id,
            change_token: None,
        }
    }
}
