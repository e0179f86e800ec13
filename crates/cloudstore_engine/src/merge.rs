//! Three-way merge of local edits with a newer remote snapshot.

use crate::config::MergePolicy;
use crate::error::SyncResult;
use crate::mapper::{FieldChange, RecordDiff, RecordMapper};
use crate::resolver;
use cloudstore_cache::{CacheTransaction, LocalRecord, RowId};
use cloudstore_protocol::Record;
use tracing::debug;

/// Merges local edits into `remote`.
///
/// `local` holds the fields changed locally since `ancestor`, the
/// baseline both sides started from. The returned record carries the
/// remote change tag and is what the entity row should show afterwards.
pub fn merge_records(
    policy: MergePolicy,
    ancestor: &Record,
    local: &RecordDiff,
    remote: &Record,
) -> Record {
    let mut merged = remote.clone();
    if policy == MergePolicy::Overwrite {
        return merged;
    }
    for (name, change) in local {
        let remote_changed = remote.get(name) != ancestor.get(name);
        if policy == MergePolicy::PropertyRemoteTrump && remote_changed {
            continue;
        }
        match change {
            FieldChange::Set(value) => merged.set(name.clone(), value.clone()),
            FieldChange::Remove => {
                merged.remove(name);
            }
        }
    }
    merged
}

/// Merges a newer remote snapshot into a locally modified row.
///
/// The ancestor is the record's conflict ancestor if it has one, its
/// baseline otherwise. Afterwards `remote` is the baseline and the
/// record is clean unless local edits survived the merge. Returns true
/// if the record is still dirty.
pub(crate) fn merge_into_row(
    txn: &mut CacheTransaction<'_>,
    mapper: &RecordMapper,
    policy: MergePolicy,
    mut local: LocalRecord,
    row_id: RowId,
    remote: Record,
) -> SyncResult<bool> {
    let ancestor = local
        .merge_ancestor
        .take()
        .unwrap_or_else(|| local.cached_remote.clone());
    let row = txn.require_row(row_id)?.clone();
    let local_diff = mapper.to_remote_diff(&*txn, &row, &ancestor)?;
    let merged = merge_records(policy, &ancestor, &local_diff, &remote);
    resolver::write_record(txn, mapper, row_id, &merged)?;

    let row = txn.require_row(row_id)?.clone();
    let still_dirty = !mapper.to_remote_diff(&*txn, &row, &remote)?.is_empty();
    debug!(
        record = %local.record_id,
        policy = ?policy,
        local_fields = local_diff.len(),
        still_dirty,
        "merged remote record into local edits"
    );
    local.cached_remote = remote;
    if !still_dirty {
        local.cached_record_version = local.version;
    }
    txn.put_record(local);
    Ok(still_dirty)
}
