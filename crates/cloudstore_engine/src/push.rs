//! Push reconciler: uploads dirty records and folds the results back in.
//!
//! A push runs in three steps. The dirty set is turned into a batch of
//! saves and deletes inside one cache transaction. The batch is sent in a
//! single modify request. The per-record outcomes are then applied in a
//! second transaction. Local edits made while the request is in flight
//! bump the version past the one that was sent, so they stay dirty.

use crate::config::MergePolicy;
use crate::error::{SyncError, SyncResult};
use crate::mapper::RecordMapper;
use crate::merge;
use cloudstore_cache::{BackingCache, CacheTransaction, CommitOrigin, LocalRecord};
use cloudstore_protocol::{
    Record, RecordId, RecordOutcome, RemoteDatabase, RemoteError, RemoteErrorCode, ZoneId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Records saved remotely.
    pub saved: usize,
    /// Records deleted remotely.
    pub deleted: usize,
    /// Tombstones dropped without a round trip.
    pub purged: usize,
    /// Records marked clean without a round trip.
    pub advanced: usize,
    /// Records rejected because the remote copy changed.
    pub conflicts: usize,
    /// Records rejected for any other reason.
    pub failed: usize,
    /// Placeholder records held back until a pull fills them in.
    pub held: usize,
}

impl PushReport {
    /// Returns true if a pull is needed to settle conflicts.
    pub fn has_conflicts(&self) -> bool {
        self.conflicts > 0
    }

    /// Returns true if nothing was sent or changed.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Default)]
struct Batch {
    saves: Vec<Record>,
    deletes: Vec<RecordId>,
    versions: BTreeMap<String, u64>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }
}

/// Uploads local changes to the remote store.
#[derive(Clone)]
pub struct PushReconciler {
    remote: Arc<dyn RemoteDatabase>,
    cache: Arc<BackingCache>,
    mapper: Arc<RecordMapper>,
    policy: MergePolicy,
    zone_id: ZoneId,
}

impl PushReconciler {
    /// Creates a reconciler.
    pub fn new(
        remote: Arc<dyn RemoteDatabase>,
        cache: Arc<BackingCache>,
        mapper: Arc<RecordMapper>,
        policy: MergePolicy,
        zone_id: ZoneId,
    ) -> Self {
        Self {
            remote,
            cache,
            mapper,
            policy,
            zone_id,
        }
    }

    /// Pushes every dirty record.
    ///
    /// Conflicts are not errors: the record keeps its local edits, gains a
    /// merge ancestor and is counted in [`PushReport::conflicts`]. A
    /// transient failure of the whole request or of any record is returned
    /// as an error after the other outcomes have been applied.
    pub async fn push(&self) -> SyncResult<PushReport> {
        let mut report = PushReport::default();
        let batch = self
            .cache
            .transaction(CommitOrigin::Push, |txn| self.prepare(txn, &mut report))?;

        if batch.is_empty() {
            debug!(zone = %self.zone_id, purged = report.purged, advanced = report.advanced, "nothing to push");
            return Ok(report);
        }

        debug!(
            zone = %self.zone_id,
            saves = batch.saves.len(),
            deletes = batch.deletes.len(),
            "pushing records"
        );
        let result = self
            .remote
            .modify_records(batch.saves, batch.deletes)
            .await?;

        let transient = self.cache.transaction(CommitOrigin::Push, |txn| {
            let mut transient = None;
            for outcome in result.outcomes {
                if let Some(error) = self.reconcile(txn, &batch.versions, outcome, &mut report)? {
                    transient.get_or_insert(error);
                }
            }
            SyncResult::Ok(transient)
        })?;

        info!(
            zone = %self.zone_id,
            saved = report.saved,
            deleted = report.deleted,
            conflicts = report.conflicts,
            failed = report.failed,
            "push applied"
        );
        match transient {
            Some(error) => Err(SyncError::Remote(error)),
            None => Ok(report),
        }
    }

    fn prepare(&self, txn: &mut CacheTransaction<'_>, report: &mut PushReport) -> SyncResult<Batch> {
        let mut batch = Batch::default();
        let dirty: Vec<LocalRecord> = txn
            .records()
            .into_iter()
            .filter(|local| local.is_dirty())
            .cloned()
            .collect();

        for mut local in dirty {
            let Some(row_id) = local.row else {
                if local.was_confirmed() {
                    batch.versions.insert(local.record_name().to_owned(), 0);
                    batch.deletes.push(local.record_id.clone());
                } else {
                    debug!(record = %local.record_id, "purging unconfirmed tombstone");
                    txn.remove_record(local.record_name());
                    report.purged += 1;
                }
                continue;
            };

            if local.placeholder {
                debug!(record = %local.record_id, "holding placeholder until the record arrives");
                report.held += 1;
                continue;
            }

            if local.merge_ancestor.is_some() {
                let name = local.record_name().to_owned();
                let remote = local.cached_remote.clone();
                if !merge::merge_into_row(txn, &self.mapper, self.policy, local, row_id, remote)? {
                    report.advanced += 1;
                    continue;
                }
                match txn.record(&name) {
                    Some(merged) => local = merged.clone(),
                    None => continue,
                }
            }

            let row = txn.require_row(row_id)?.clone();
            let diff = self.mapper.to_remote_diff(&*txn, &row, &local.cached_remote)?;
            if diff.is_empty() && local.cached_remote.is_saved() {
                local.cached_record_version = local.version;
                txn.put_record(local);
                report.advanced += 1;
                continue;
            }

            batch
                .versions
                .insert(local.record_name().to_owned(), local.version);
            batch
                .saves
                .push(RecordMapper::apply_diff(&local.cached_remote, &diff));
        }
        Ok(batch)
    }

    fn reconcile(
        &self,
        txn: &mut CacheTransaction<'_>,
        versions: &BTreeMap<String, u64>,
        outcome: RecordOutcome,
        report: &mut PushReport,
    ) -> SyncResult<Option<RemoteError>> {
        match outcome {
            RecordOutcome::Saved(record) => {
                let Some(mut local) = txn.record(record.record_name()).cloned() else {
                    return Ok(None);
                };
                if let Some(version) = versions.get(record.record_name()) {
                    local.cached_record_version = local.cached_record_version.max(*version);
                }
                local.cached_remote = record;
                local.merge_ancestor = None;
                txn.put_record(local);
                report.saved += 1;
            }
            RecordOutcome::Deleted(record_id) => {
                if self.is_still_deleted(txn, &record_id.record_name) {
                    txn.remove_record(&record_id.record_name);
                }
                report.deleted += 1;
            }
            RecordOutcome::Failed { record_id, error } => {
                return self.reconcile_failure(txn, versions, record_id, error, report);
            }
        }
        Ok(None)
    }

    fn reconcile_failure(
        &self,
        txn: &mut CacheTransaction<'_>,
        versions: &BTreeMap<String, u64>,
        record_id: RecordId,
        error: RemoteError,
        report: &mut PushReport,
    ) -> SyncResult<Option<RemoteError>> {
        let name = record_id.record_name.as_str();
        let was_delete = versions.get(name) == Some(&0);

        if error.is_conflict() {
            let Some(mut local) = txn.record(name).cloned() else {
                return Ok(None);
            };
            debug!(record = %record_id, "push conflict; keeping merge ancestor");
            if local.merge_ancestor.is_none() {
                local.merge_ancestor = Some(local.cached_remote.clone());
            }
            match error.server_record {
                Some(server) => local.cached_remote = *server,
                None => debug!(
                    record = %record_id,
                    "conflict without server record; baseline stays stale until the next pull"
                ),
            }
            txn.put_record(local);
            report.conflicts += 1;
            return Ok(None);
        }

        if was_delete && error.code == RemoteErrorCode::UnknownItem {
            if self.is_still_deleted(txn, name) {
                txn.remove_record(name);
            }
            report.deleted += 1;
            return Ok(None);
        }

        if error.is_transient() {
            debug!(record = %record_id, code = %error.code, "transient push failure");
            return Ok(Some(error));
        }

        warn!(record = %record_id, code = %error.code, message = %error.message, "record rejected by remote store");
        if let Some(server) = error.server_record.clone() {
            if let Some(mut local) = txn.record(name).cloned() {
                local.cached_remote = *server;
                txn.put_record(local);
            }
        }
        report.failed += 1;
        Ok(None)
    }

    fn is_still_deleted(&self, txn: &CacheTransaction<'_>, record_name: &str) -> bool {
        txn.record(record_name)
            .map(LocalRecord::is_tombstone)
            .unwrap_or(false)
    }
}
