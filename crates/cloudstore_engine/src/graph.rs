//! Relationship maintenance between entity rows.
//!
//! Every write to a relationship with an inverse also updates the inverse
//! on the affected target rows, so both directions always agree.

use crate::error::{SyncError, SyncResult};
use crate::schema::{Cardinality, DeleteRule, Schema};
use cloudstore_cache::{CacheTransaction, RelationValue, RowId};

/// Replaces a relationship value and keeps its inverse consistent.
///
/// Returns every row whose relationships changed, `row_id` included.
pub(crate) fn set_relationship(
    txn: &mut CacheTransaction<'_>,
    schema: &Schema,
    row_id: RowId,
    name: &str,
    value: RelationValue,
) -> SyncResult<Vec<RowId>> {
    let mut row = txn
        .row(row_id)
        .cloned()
        .ok_or(SyncError::RowNotFound(row_id))?;
    let entity = schema.require_entity(&row.entity)?;
    let relationship = entity.require_relationship(name)?;

    let value = match (relationship.cardinality, value) {
        (Cardinality::ToOne, value @ RelationValue::ToOne(_)) => value,
        (Cardinality::ToMany, RelationValue::ToMany(targets)) => {
            let mut unique = Vec::with_capacity(targets.len());
            for target in targets {
                if !unique.contains(&target) {
                    unique.push(target);
                }
            }
            RelationValue::ToMany(unique)
        }
        (Cardinality::ToOne, RelationValue::ToMany(_)) => {
            return Err(SyncError::invalid_relationship(
                &entity.name,
                name,
                "to-one relationship given several targets",
            ))
        }
        (Cardinality::ToMany, RelationValue::ToOne(target)) => {
            RelationValue::ToMany(target.into_iter().collect())
        }
    };

    let new_targets = value.targets();
    for target in &new_targets {
        let target_row = txn.row(*target).ok_or(SyncError::RowNotFound(*target))?;
        if target_row.entity != relationship.target {
            return Err(SyncError::invalid_relationship(
                &entity.name,
                name,
                format!("{target} is a {}, expected {}", target_row.entity, relationship.target),
            ));
        }
    }

    let old_targets = row
        .relationship(name)
        .map(RelationValue::targets)
        .unwrap_or_default();
    if row.relationship(name) == Some(&value) {
        return Ok(Vec::new());
    }
    row.relationships.insert(name.to_string(), value);
    txn.put_row(row);

    let mut affected = vec![row_id];
    let Some(inverse) = schema.inverse_of(relationship)? else {
        return Ok(affected);
    };
    let inverse_name = inverse.name.clone();
    let inverse_cardinality = inverse.cardinality;

    for removed in old_targets.iter().filter(|t| !new_targets.contains(*t)) {
        if let Some(mut target) = txn.row(*removed).cloned() {
            let changed = target
                .relationships
                .get_mut(&inverse_name)
                .is_some_and(|v| v.remove(row_id));
            if changed {
                txn.put_row(target);
                affected.push(*removed);
            }
        }
    }

    for added in new_targets.iter().filter(|t| !old_targets.contains(*t)) {
        let Some(mut target) = txn.row(*added).cloned() else {
            continue;
        };
        match inverse_cardinality {
            Cardinality::ToOne => {
                let previous = match target.relationship(&inverse_name) {
                    Some(RelationValue::ToOne(previous)) => *previous,
                    _ => None,
                };
                target
                    .relationships
                    .insert(inverse_name.clone(), RelationValue::ToOne(Some(row_id)));
                txn.put_row(target);
                // The target can only point back at one row.
                if let Some(previous) = previous.filter(|p| *p != row_id) {
                    if let Some(mut holder) = txn.row(previous).cloned() {
                        let changed = holder
                            .relationships
                            .get_mut(name)
                            .is_some_and(|v| v.remove(*added));
                        if changed {
                            txn.put_row(holder);
                            affected.push(previous);
                        }
                    }
                }
            }
            Cardinality::ToMany => {
                let entry = target
                    .relationships
                    .entry(inverse_name.clone())
                    .or_insert_with(|| RelationValue::ToMany(Vec::new()));
                if let RelationValue::ToMany(list) = entry {
                    if !list.contains(&row_id) {
                        list.push(row_id);
                    }
                } else {
                    *entry = RelationValue::ToMany(vec![row_id]);
                }
                txn.put_row(target);
            }
        }
        affected.push(*added);
    }

    Ok(affected)
}

/// Removes every inverse reference to `row_id` before the row is deleted.
///
/// With `honour_no_action`, relationships whose delete rule is
/// [`DeleteRule::NoAction`] leave their targets untouched.
pub(crate) fn detach_row(
    txn: &mut CacheTransaction<'_>,
    schema: &Schema,
    row_id: RowId,
    honour_no_action: bool,
) -> SyncResult<Vec<RowId>> {
    let Some(row) = txn.row(row_id).cloned() else {
        return Ok(Vec::new());
    };
    let entity = schema.require_entity(&row.entity)?;
    let mut affected = Vec::new();

    for relationship in &entity.relationships {
        if honour_no_action && relationship.delete_rule == DeleteRule::NoAction {
            continue;
        }
        let Some(inverse) = &relationship.inverse else {
            continue;
        };
        let targets = row
            .relationship(&relationship.name)
            .map(RelationValue::targets)
            .unwrap_or_default();
        for target_id in targets {
            let Some(mut target) = txn.row(target_id).cloned() else {
                continue;
            };
            if target
                .relationships
                .get_mut(inverse)
                .is_some_and(|v| v.remove(row_id))
            {
                txn.put_row(target);
                affected.push(target_id);
            }
        }
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityDescriptor, RelationshipDescriptor};
    use cloudstore_cache::{BackingCache, CommitOrigin, EntityRow};

    fn schema() -> Schema {
        Schema::new(vec![
            EntityDescriptor::new("Parent").relationship(
                RelationshipDescriptor::to_many("children", "Child")
                    .with_inverse("parent")
                    .with_delete_rule(DeleteRule::Cascade),
            ),
            EntityDescriptor::new("Child").relationship(
                RelationshipDescriptor::to_one("parent", "Parent").with_inverse("children"),
            ),
            EntityDescriptor::new("Husband").relationship(
                RelationshipDescriptor::to_one("wife", "Wife").with_inverse("husband"),
            ),
            EntityDescriptor::new("Wife").relationship(
                RelationshipDescriptor::to_one("husband", "Husband").with_inverse("wife"),
            ),
        ])
        .unwrap()
    }

    fn seed(txn: &mut CacheTransaction<'_>, rows: &[(u64, &str)]) {
        for (id, entity) in rows {
            txn.put_row(EntityRow::new(RowId(*id), *entity, format!("R{id}")));
        }
    }

    #[test]
    fn setting_to_one_updates_inverse_to_many() {
        let cache = BackingCache::open_in_memory().unwrap();
        let schema = schema();
        cache
            .transaction(CommitOrigin::LocalSave, |txn| {
                seed(txn, &[(1, "Parent"), (2, "Parent"), (3, "Child")]);
                set_relationship(txn, &schema, RowId(3), "parent", RelationValue::ToOne(Some(RowId(1))))?;
                assert_eq!(
                    txn.row(RowId(1)).unwrap().relationship("children"),
                    Some(&RelationValue::ToMany(vec![RowId(3)]))
                );

                let affected = set_relationship(
                    txn,
                    &schema,
                    RowId(3),
                    "parent",
                    RelationValue::ToOne(Some(RowId(2))),
                )?;
                assert!(affected.contains(&RowId(1)));
                assert!(affected.contains(&RowId(2)));
                assert_eq!(
                    txn.row(RowId(1)).unwrap().relationship("children"),
                    Some(&RelationValue::ToMany(vec![]))
                );
                assert_eq!(
                    txn.row(RowId(2)).unwrap().relationship("children"),
                    Some(&RelationValue::ToMany(vec![RowId(3)]))
                );
                Ok::<_, SyncError>(())
            })
            .unwrap();
    }

    #[test]
    fn setting_to_many_steals_from_previous_parent() {
        let cache = BackingCache::open_in_memory().unwrap();
        let schema = schema();
        cache
            .transaction(CommitOrigin::LocalSave, |txn| {
                seed(txn, &[(1, "Parent"), (2, "Parent"), (3, "Child")]);
                set_relationship(txn, &schema, RowId(1), "children", RelationValue::ToMany(vec![RowId(3)]))?;
                set_relationship(txn, &schema, RowId(2), "children", RelationValue::ToMany(vec![RowId(3), RowId(3)]))?;

                assert_eq!(
                    txn.row(RowId(3)).unwrap().relationship("parent"),
                    Some(&RelationValue::ToOne(Some(RowId(2))))
                );
                assert_eq!(
                    txn.row(RowId(1)).unwrap().relationship("children"),
                    Some(&RelationValue::ToMany(vec![]))
                );
                assert_eq!(
                    txn.row(RowId(2)).unwrap().relationship("children"),
                    Some(&RelationValue::ToMany(vec![RowId(3)]))
                );
                Ok::<_, SyncError>(())
            })
            .unwrap();
    }

    #[test]
    fn one_to_one_relinks() {
        let cache = BackingCache::open_in_memory().unwrap();
        let schema = schema();
        cache
            .transaction(CommitOrigin::LocalSave, |txn| {
                seed(txn, &[(1, "Husband"), (2, "Husband"), (3, "Wife")]);
                set_relationship(txn, &schema, RowId(1), "wife", RelationValue::ToOne(Some(RowId(3))))?;
                set_relationship(txn, &schema, RowId(2), "wife", RelationValue::ToOne(Some(RowId(3))))?;

                assert_eq!(
                    txn.row(RowId(1)).unwrap().relationship("wife"),
                    Some(&RelationValue::ToOne(None))
                );
                assert_eq!(
                    txn.row(RowId(3)).unwrap().relationship("husband"),
                    Some(&RelationValue::ToOne(Some(RowId(2))))
                );
                Ok::<_, SyncError>(())
            })
            .unwrap();
    }

    #[test]
    fn rejects_wrong_target_entity() {
        let cache = BackingCache::open_in_memory().unwrap();
        let schema = schema();
        let err = cache
            .transaction(CommitOrigin::LocalSave, |txn| {
                seed(txn, &[(1, "Parent"), (2, "Parent")]);
                set_relationship(txn, &schema, RowId(1), "children", RelationValue::ToMany(vec![RowId(2)]))
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRelationship { .. }));
    }

    #[test]
    fn detach_clears_inverse() {
        let cache = BackingCache::open_in_memory().unwrap();
        let schema = schema();
        cache
            .transaction(CommitOrigin::LocalSave, |txn| {
                seed(txn, &[(1, "Parent"), (3, "Child")]);
                set_relationship(txn, &schema, RowId(3), "parent", RelationValue::ToOne(Some(RowId(1))))?;
                let affected = detach_row(txn, &schema, RowId(3), true)?;
                assert_eq!(affected, vec![RowId(1)]);
                assert_eq!(
                    txn.row(RowId(1)).unwrap().relationship("children"),
                    Some(&RelationValue::ToMany(vec![]))
                );
                Ok::<_, SyncError>(())
            })
            .unwrap();
    }
}
