//! Resolution of remote records and references to entity rows.

use crate::error::SyncResult;
use crate::graph;
use crate::mapper::{DecodedRelation, RecordMapper, RecordRef};
use crate::schema::EntityDescriptor;
use cloudstore_cache::{CacheTransaction, EntityRow, LocalRecord, RelationValue, RowId};
use cloudstore_protocol::Record;
use tracing::warn;

/// Creates a row holding the declared attribute defaults.
pub(crate) fn blank_row(
    entity: &EntityDescriptor,
    row_id: RowId,
    record_name: impl Into<String>,
) -> EntityRow {
    let mut row = EntityRow::new(row_id, entity.name.clone(), record_name);
    for attribute in &entity.attributes {
        row.set_attribute(attribute.name.clone(), attribute.default.clone());
    }
    row
}

/// Resolves a reference to the row of its local record.
///
/// A record not seen yet gets a placeholder that the record itself fills
/// in when it arrives. Placeholders are held back from pushes until then. References to locally deleted records and to
/// rows of another entity resolve to `None`.
pub(crate) fn resolve_reference(
    txn: &mut CacheTransaction<'_>,
    mapper: &RecordMapper,
    reference: &RecordRef,
) -> SyncResult<Option<RowId>> {
    let record_name = &reference.record_id.record_name;
    if let Some(local) = txn.record(record_name) {
        if local.record_type != reference.entity {
            warn!(
                record = %record_name,
                expected = %reference.entity,
                found = %local.record_type,
                "reference to a record of another entity"
            );
            return Ok(None);
        }
        return Ok(local.row);
    }

    let entity = mapper.schema().require_entity(&reference.entity)?;
    let row_id = txn.allocate_row_id();
    txn.put_row(blank_row(entity, row_id, record_name.clone()));
    txn.put_record(LocalRecord::placeholder(
        entity.name.clone(),
        reference.record_id.clone(),
        row_id,
    ));
    Ok(Some(row_id))
}

/// Writes the decoded values of `record` into an existing row.
///
/// Attributes are replaced wholesale; owned relationships are resolved and
/// set with their inverses kept consistent.
pub(crate) fn write_record(
    txn: &mut CacheTransaction<'_>,
    mapper: &RecordMapper,
    row_id: RowId,
    record: &Record,
) -> SyncResult<()> {
    let decoded = mapper.from_remote_record(record)?;

    let mut row = txn.require_row(row_id)?.clone();
    for (name, value) in decoded.attributes {
        row.set_attribute(name, value);
    }
    txn.put_row(row);

    for (name, relation) in decoded.relationships {
        let value = match relation {
            DecodedRelation::ToOne(None) => RelationValue::ToOne(None),
            DecodedRelation::ToOne(Some(target)) => {
                RelationValue::ToOne(resolve_reference(txn, mapper, &target)?)
            }
            DecodedRelation::ToMany(targets) => {
                let mut rows = Vec::with_capacity(targets.len());
                for target in &targets {
                    if let Some(row) = resolve_reference(txn, mapper, target)? {
                        rows.push(row);
                    }
                }
                RelationValue::ToMany(rows)
            }
        };
        graph::set_relationship(txn, mapper.schema(), row_id, &name, value)?;
    }
    Ok(())
}

/// Inserts a row and local record for a record seen for the first time.
pub(crate) fn insert_record(
    txn: &mut CacheTransaction<'_>,
    mapper: &RecordMapper,
    record: &Record,
) -> SyncResult<RowId> {
    let entity = mapper.schema().require_entity(&record.record_type)?;
    let row_id = txn.allocate_row_id();
    txn.put_row(blank_row(entity, row_id, record.record_name()));
    txn.put_record(LocalRecord::from_remote(record.clone(), row_id));
    write_record(txn, mapper, row_id, record)?;
    Ok(row_id)
}

/// Deletes a row and its local record, clearing inverse references.
pub(crate) fn remove_record(
    txn: &mut CacheTransaction<'_>,
    mapper: &RecordMapper,
    record_name: &str,
) -> SyncResult<bool> {
    let Some(local) = txn.record(record_name).cloned() else {
        return Ok(false);
    };
    if let Some(row_id) = local.row {
        graph::detach_row(txn, mapper.schema(), row_id, false)?;
        txn.remove_row(row_id);
    }
    txn.remove_record(record_name);
    Ok(true)
}
