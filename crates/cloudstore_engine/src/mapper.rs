//! Translation between entity rows and remote records.

use crate::error::SyncResult;
use crate::schema::{AttributeDescriptor, Cardinality, RelationshipDescriptor, Schema};
use cloudstore_cache::{CacheTransaction, EntityRow, RelationValue, RowId};
use cloudstore_codec::{ByteTransform, ScalarKind, Value};
use cloudstore_protocol::{FieldValue, Record, RecordId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resolves entity rows to the identity of their remote records.
pub trait RecordIndex {
    /// Returns the record id owning `row`, if the row exists.
    fn record_id_for_row(&self, row: RowId) -> Option<RecordId>;
}

impl RecordIndex for CacheTransaction<'_> {
    fn record_id_for_row(&self, row: RowId) -> Option<RecordId> {
        self.record_for_row(row).map(|record| record.record_id.clone())
    }
}

/// One field of a diff.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// The field takes a new value.
    Set(FieldValue),
    /// The field is removed from the record.
    Remove,
}

/// Fields that differ between an entity row and a baseline record.
pub type RecordDiff = BTreeMap<String, FieldChange>;

/// A reference decoded from a remote record, not yet resolved to a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    /// Target record.
    pub record_id: RecordId,
    /// Target entity name.
    pub entity: String,
}

/// Decoded value of a serialized relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRelation {
    /// To-one target.
    ToOne(Option<RecordRef>),
    /// To-many targets in record order.
    ToMany(Vec<RecordRef>),
}

/// Local values decoded from a remote record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedRecord {
    /// Every declared attribute, defaults filled in.
    pub attributes: BTreeMap<String, Value>,
    /// Every serialized relationship.
    pub relationships: BTreeMap<String, DecodedRelation>,
}

/// Translates between entity rows and remote records using a [`Schema`].
#[derive(Debug, Clone)]
pub struct RecordMapper {
    schema: Arc<Schema>,
    transform: Arc<dyn ByteTransform>,
}

impl RecordMapper {
    /// Creates a mapper.
    pub fn new(schema: Arc<Schema>, transform: Arc<dyn ByteTransform>) -> Self {
        Self { schema, transform }
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Computes the fields of `row` that differ from `baseline`.
    ///
    /// Attributes are compared after decoding the baseline, so a field the
    /// remote store compressed differently still compares equal. Only
    /// relationships this side owns are considered.
    pub fn to_remote_diff(
        &self,
        index: &dyn RecordIndex,
        row: &EntityRow,
        baseline: &Record,
    ) -> SyncResult<RecordDiff> {
        let entity = self.schema.require_entity(&row.entity)?;
        let mut diff = RecordDiff::new();

        for attribute in &entity.attributes {
            let current = row.attribute(&attribute.name);
            let field = baseline.get(&attribute.name);
            if current.is_null() {
                if field.is_some() {
                    diff.insert(attribute.name.clone(), FieldChange::Remove);
                }
                continue;
            }
            if self.decode_attribute(attribute, field) == *current {
                continue;
            }
            let encoded = self.encode_attribute(attribute, current)?;
            diff.insert(
                attribute.name.clone(),
                FieldChange::Set(FieldValue::Scalar(encoded)),
            );
        }

        for relationship in entity.serialized_relationships() {
            let current = reference_field(index, relationship, row.relationship(&relationship.name));
            let remote = baseline
                .get(&relationship.name)
                .and_then(|field| normalize_reference(relationship, field));
            match (current, remote) {
                (None, None) => {}
                (None, Some(_)) => {
                    diff.insert(relationship.name.clone(), FieldChange::Remove);
                }
                (Some(current), remote) if Some(&current) == remote.as_ref() => {}
                (Some(current), _) => {
                    diff.insert(relationship.name.clone(), FieldChange::Set(current));
                }
            }
        }

        Ok(diff)
    }

    /// Returns a copy of `baseline` with `diff` applied.
    ///
    /// The copy keeps the baseline's change tag.
    pub fn apply_diff(baseline: &Record, diff: &RecordDiff) -> Record {
        let mut record = baseline.clone();
        for (name, change) in diff {
            match change {
                FieldChange::Set(value) => record.set(name.clone(), value.clone()),
                FieldChange::Remove => {
                    record.remove(name);
                }
            }
        }
        record
    }

    /// Decodes the attributes and owned relationships of a remote record.
    pub fn from_remote_record(&self, record: &Record) -> SyncResult<DecodedRecord> {
        let entity = self.schema.require_entity(&record.record_type)?;
        let mut decoded = DecodedRecord::default();

        for attribute in &entity.attributes {
            decoded.attributes.insert(
                attribute.name.clone(),
                self.decode_attribute(attribute, record.get(&attribute.name)),
            );
        }

        for relationship in entity.serialized_relationships() {
            let reference = |record_id: &RecordId| RecordRef {
                record_id: record_id.clone(),
                entity: relationship.target.clone(),
            };
            let value = match (relationship.cardinality, record.get(&relationship.name)) {
                (Cardinality::ToOne, Some(FieldValue::Reference(id))) => {
                    DecodedRelation::ToOne(Some(reference(id)))
                }
                (Cardinality::ToOne, _) => DecodedRelation::ToOne(None),
                (Cardinality::ToMany, Some(FieldValue::ReferenceList(ids))) => {
                    DecodedRelation::ToMany(ids.iter().map(reference).collect())
                }
                (Cardinality::ToMany, Some(FieldValue::Reference(id))) => {
                    DecodedRelation::ToMany(vec![reference(id)])
                }
                (Cardinality::ToMany, _) => DecodedRelation::ToMany(Vec::new()),
            };
            decoded.relationships.insert(relationship.name.clone(), value);
        }

        Ok(decoded)
    }

    /// Decodes one remote field into the attribute's kind.
    ///
    /// Missing, null and unusable fields decode to the attribute default.
    pub fn decode_attribute(
        &self,
        attribute: &AttributeDescriptor,
        field: Option<&FieldValue>,
    ) -> Value {
        let Some(FieldValue::Scalar(raw)) = field else {
            return attribute.default.clone();
        };
        let coerced = match raw {
            Value::Bytes(bytes) if attribute.kind == ScalarKind::Binary && attribute.transformed => {
                attribute
                    .kind
                    .coerce(&Value::Bytes(self.transform.decode_or_raw(bytes)))
            }
            other => attribute.kind.coerce(other),
        };
        coerced.unwrap_or_else(|| attribute.default.clone())
    }

    /// Encodes a local attribute value into its remote form.
    pub fn encode_attribute(
        &self,
        attribute: &AttributeDescriptor,
        value: &Value,
    ) -> SyncResult<Value> {
        match value {
            Value::Bytes(bytes) if attribute.kind == ScalarKind::Binary && attribute.transformed => {
                Ok(Value::Bytes(self.transform.encode(bytes)?))
            }
            other => Ok(other.clone()),
        }
    }
}

fn reference_field(
    index: &dyn RecordIndex,
    relationship: &RelationshipDescriptor,
    value: Option<&RelationValue>,
) -> Option<FieldValue> {
    match value? {
        RelationValue::ToOne(target) => index
            .record_id_for_row((*target)?)
            .map(FieldValue::Reference),
        RelationValue::ToMany(targets) => {
            let mut ids: Vec<RecordId> = targets
                .iter()
                .filter_map(|target| index.record_id_for_row(*target))
                .collect();
            if ids.is_empty() {
                return None;
            }
            if !relationship.ordered {
                ids.sort();
            }
            Some(FieldValue::ReferenceList(ids))
        }
    }
}

fn normalize_reference(relationship: &RelationshipDescriptor, field: &FieldValue) -> Option<FieldValue> {
    match field {
        FieldValue::ReferenceList(ids) if ids.is_empty() => None,
        FieldValue::ReferenceList(ids) if !relationship.ordered => {
            let mut ids = ids.clone();
            ids.sort();
            Some(FieldValue::ReferenceList(ids))
        }
        other => Some(other.clone()),
    }
}
