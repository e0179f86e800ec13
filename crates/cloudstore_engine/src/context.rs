//! Local edits to entity rows.

use crate::error::{SyncError, SyncResult};
use crate::graph;
use crate::resolver::blank_row;
use crate::schema::{DeleteRule, Schema};
use cloudstore_cache::{CacheTransaction, EntityRow, LocalRecord, RelationValue, RowId};
use cloudstore_codec::Value;
use cloudstore_protocol::{RecordId, ZoneId};
use std::collections::BTreeSet;

/// A set of local edits applied in one cache transaction.
///
/// Obtained from [`SyncStore::save`](crate::SyncStore::save). Every row
/// changed through the context has its local record's `version` bumped
/// exactly once when the save commits, which marks it dirty for the next
/// push.
pub struct SaveContext<'t, 'c> {
    txn: &'t mut CacheTransaction<'c>,
    schema: &'t Schema,
    zone_id: &'t ZoneId,
    touched: BTreeSet<RowId>,
}

impl<'t, 'c> SaveContext<'t, 'c> {
    pub(crate) fn new(
        txn: &'t mut CacheTransaction<'c>,
        schema: &'t Schema,
        zone_id: &'t ZoneId,
    ) -> Self {
        Self {
            txn,
            schema,
            zone_id,
            touched: BTreeSet::new(),
        }
    }

    /// Inserts a new entity with a fresh record name.
    pub fn insert(&mut self, entity: &str) -> SyncResult<RowId> {
        let record_id = RecordId::random(self.zone_id.clone());
        self.insert_named(entity, record_id.record_name)
    }

    /// Inserts a new entity with the given record name.
    pub fn insert_named(
        &mut self,
        entity: &str,
        record_name: impl Into<String>,
    ) -> SyncResult<RowId> {
        let record_name = record_name.into();
        let descriptor = self.schema.require_entity(entity)?;
        if self.txn.record(&record_name).is_some() {
            return Err(SyncError::DuplicateRecord(record_name));
        }

        let row_id = self.txn.allocate_row_id();
        self.txn
            .put_row(blank_row(descriptor, row_id, record_name.clone()));
        self.txn.put_record(LocalRecord::created_locally(
            entity,
            RecordId::new(record_name, self.zone_id.clone()),
            row_id,
        ));
        self.touched.insert(row_id);
        Ok(row_id)
    }

    /// Sets an attribute, coercing the value to the declared kind.
    ///
    /// `Value::Null` clears the attribute.
    pub fn set(&mut self, row_id: RowId, attribute: &str, value: impl Into<Value>) -> SyncResult<()> {
        let value = value.into();
        let mut row = self.require(row_id)?.clone();
        let descriptor = self
            .schema
            .require_entity(&row.entity)?
            .require_attribute(attribute)?;

        let stored = if value.is_null() {
            Value::Null
        } else {
            descriptor
                .kind
                .coerce(&value)
                .ok_or_else(|| SyncError::TypeMismatch {
                    entity: row.entity.clone(),
                    attribute: attribute.to_string(),
                    expected: descriptor.kind,
                    found: value.type_name(),
                })?
        };
        if *row.attribute(attribute) == stored {
            return Ok(());
        }
        row.set_attribute(attribute, stored);
        self.txn.put_row(row);
        self.touched.insert(row_id);
        Ok(())
    }

    /// Returns an attribute value.
    pub fn get(&self, row_id: RowId, attribute: &str) -> SyncResult<Value> {
        let row = self.require(row_id)?;
        self.schema
            .require_entity(&row.entity)?
            .require_attribute(attribute)?;
        Ok(row.attribute(attribute).clone())
    }

    /// Sets a to-one relationship.
    pub fn set_to_one(
        &mut self,
        row_id: RowId,
        relationship: &str,
        target: Option<RowId>,
    ) -> SyncResult<()> {
        self.set_relationship(row_id, relationship, RelationValue::ToOne(target))
    }

    /// Replaces the targets of a to-many relationship.
    pub fn set_to_many(
        &mut self,
        row_id: RowId,
        relationship: &str,
        targets: Vec<RowId>,
    ) -> SyncResult<()> {
        self.set_relationship(row_id, relationship, RelationValue::ToMany(targets))
    }

    /// Appends a target to a to-many relationship.
    pub fn add_to_many(&mut self, row_id: RowId, relationship: &str, target: RowId) -> SyncResult<()> {
        let mut targets = self.related(row_id, relationship)?;
        if targets.contains(&target) {
            return Ok(());
        }
        targets.push(target);
        self.set_to_many(row_id, relationship, targets)
    }

    /// Removes a target from a to-many relationship.
    pub fn remove_from_many(
        &mut self,
        row_id: RowId,
        relationship: &str,
        target: RowId,
    ) -> SyncResult<()> {
        let mut targets = self.related(row_id, relationship)?;
        targets.retain(|t| *t != target);
        self.set_to_many(row_id, relationship, targets)
    }

    /// Returns the rows a relationship points at.
    pub fn related(&self, row_id: RowId, relationship: &str) -> SyncResult<Vec<RowId>> {
        let row = self.require(row_id)?;
        self.schema
            .require_entity(&row.entity)?
            .require_relationship(relationship)?;
        Ok(row
            .relationship(relationship)
            .map(RelationValue::targets)
            .unwrap_or_default())
    }

    fn set_relationship(
        &mut self,
        row_id: RowId,
        relationship: &str,
        value: RelationValue,
    ) -> SyncResult<()> {
        let affected = graph::set_relationship(self.txn, self.schema, row_id, relationship, value)?;
        self.touched.extend(affected);
        Ok(())
    }

    /// Deletes a row, applying delete rules.
    ///
    /// The local record stays behind as a tombstone until the deletion is
    /// pushed.
    pub fn delete(&mut self, row_id: RowId) -> SyncResult<()> {
        self.require(row_id)?;

        let mut pending = vec![row_id];
        let mut seen = BTreeSet::new();
        let mut doomed = Vec::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(row) = self.txn.row(id) else {
                continue;
            };
            let entity = self.schema.require_entity(&row.entity)?;
            for relationship in &entity.relationships {
                if relationship.delete_rule == DeleteRule::Cascade {
                    if let Some(value) = row.relationship(&relationship.name) {
                        pending.extend(value.targets());
                    }
                }
            }
            doomed.push(id);
        }

        for id in doomed {
            let affected = graph::detach_row(self.txn, self.schema, id, true)?;
            self.touched.extend(affected);
            let Some(row) = self.txn.row(id) else {
                continue;
            };
            let record_name = row.record_name.clone();
            self.txn.remove_row(id);
            self.touched.remove(&id);
            if let Some(mut record) = self.txn.record(&record_name).cloned() {
                record.version = 0;
                record.row = None;
                self.txn.put_record(record);
            }
        }
        Ok(())
    }

    /// Returns the rows of an entity ordered by row id.
    pub fn fetch(&self, entity: &str) -> SyncResult<Vec<RowId>> {
        self.schema.require_entity(entity)?;
        Ok(self
            .txn
            .rows()
            .into_iter()
            .filter(|row| row.entity == entity)
            .map(|row| row.row_id)
            .collect())
    }

    /// Returns a row.
    pub fn row(&self, row_id: RowId) -> Option<&EntityRow> {
        self.txn.row(row_id)
    }

    /// Finds the row of a record.
    pub fn find(&self, record_name: &str) -> Option<RowId> {
        self.txn.row_for_record(record_name).map(|row| row.row_id)
    }

    /// Returns the record name of a row.
    pub fn record_name(&self, row_id: RowId) -> Option<&str> {
        self.txn.row(row_id).map(|row| row.record_name.as_str())
    }

    fn require(&self, row_id: RowId) -> SyncResult<&EntityRow> {
        self.txn.row(row_id).ok_or(SyncError::RowNotFound(row_id))
    }

    /// Bumps the version of every changed row; returns how many.
    pub(crate) fn finish(self) -> usize {
        let mut bumped = 0;
        for row_id in self.touched {
            if let Some(mut record) = self.txn.record_for_row(row_id).cloned() {
                record.version += 1;
                self.txn.put_record(record);
                bumped += 1;
            }
        }
        bumped
    }
}
