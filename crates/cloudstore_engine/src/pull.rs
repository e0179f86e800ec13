//! Pull reconciler: applies the remote change feed to the local cache.
//!
//! All pages of a pull are fetched and staged before anything is applied.
//! The staged batch and the new change token are then committed in a
//! single cache transaction, so the durable token never runs ahead of the
//! applied changes.

use crate::config::MergePolicy;
use crate::error::SyncResult;
use crate::mapper::RecordMapper;
use crate::merge;
use crate::resolver;
use cloudstore_cache::{BackingCache, CacheTransaction, CommitOrigin, LocalRecord, SyncMetadata};
use cloudstore_protocol::{ChangeToken, Record, RemoteDatabase, ZoneChange, ZoneId};
use std::sync::Arc;
use tracing::{debug, info};

/// Pagination state of one pull.
///
/// Kept by the pull operation across queue retries so a retry resumes
/// from the last fetched page.
#[derive(Debug, Default)]
pub struct PullSession {
    started: bool,
    token: Option<ChangeToken>,
    staged: Vec<ZoneChange>,
    pages: usize,
    skipped: usize,
}

impl PullSession {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of staged changes.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Returns the number of pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

/// Outcome of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Records inserted or updated.
    pub changed: usize,
    /// Records deleted.
    pub deleted: usize,
    /// Changed records of unknown entities.
    pub skipped: usize,
    /// Pages fetched.
    pub pages: usize,
}

/// Applies remote changes to the backing cache.
#[derive(Clone)]
pub struct PullReconciler {
    remote: Arc<dyn RemoteDatabase>,
    cache: Arc<BackingCache>,
    mapper: Arc<RecordMapper>,
    policy: MergePolicy,
    zone_id: ZoneId,
}

impl PullReconciler {
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

    /// Runs a complete pull from the stored change token.
    pub async fn pull(&self) -> SyncResult<PullReport> {
        self.run(&mut PullSession::new()).await
    }

    /// Runs or resumes a pull.
    ///
    /// On a fetch error the session keeps its staged pages and token and
    /// the cache is untouched. On success the session is reset.
    pub async fn run(&self, session: &mut PullSession) -> SyncResult<PullReport> {
        if !session.started {
            session.token = self.cache.metadata().and_then(|m| m.change_token);
            session.started = true;
        }

        loop {
            let page = self
                .remote
                .fetch_zone_changes(&self.zone_id, session.token.as_ref())
                .await?;
            session.pages += 1;
            debug!(
                zone = %self.zone_id,
                page = session.pages,
                changes = page.changes.len(),
                more_coming = page.more_coming,
                "fetched change page"
            );
            for change in page.changes {
                match &change {
                    ZoneChange::Changed(record)
                        if self.mapper.schema().entity(&record.record_type).is_none() =>
                    {
                        debug!(record = %record.record_id, record_type = %record.record_type, "skipping record of unknown entity");
                        session.skipped += 1;
                    }
                    _ => session.staged.push(change),
                }
            }
            session.token = Some(page.new_token);
            if !page.more_coming {
                break;
            }
        }

        let report = self.apply(session)?;
        *session = PullSession::new();
        info!(
            zone = %self.zone_id,
            changed = report.changed,
            deleted = report.deleted,
            pages = report.pages,
            "pull applied"
        );
        Ok(report)
    }

    fn apply(&self, session: &PullSession) -> SyncResult<PullReport> {
        let mut report = PullReport {
            skipped: session.skipped,
            pages: session.pages,
            ..PullReport::default()
        };
        self.cache.transaction(CommitOrigin::Pull, |txn| {
            for change in &session.staged {
                match change {
                    ZoneChange::Changed(record) => {
                        self.apply_upsert(txn, record)?;
                        report.changed += 1;
                    }
                    ZoneChange::Deleted(record_id) => {
                        if resolver::remove_record(txn, &self.mapper, &record_id.record_name)? {
                            report.deleted += 1;
                        }
                    }
                }
            }

            let mut metadata = txn
                .metadata()
                .cloned()
                .unwrap_or_else(|| SyncMetadata::new(self.zone_id.clone()));
            if metadata.change_token != session.token {
                metadata.change_token = session.token.clone();
                txn.set_metadata(metadata);
            }
            SyncResult::Ok(())
        })?;
        Ok(report)
    }

    fn apply_upsert(&self, txn: &mut CacheTransaction<'_>, record: &Record) -> SyncResult<()> {
        let Some(mut local) = txn.record(record.record_name()).cloned() else {
            resolver::insert_record(txn, &self.mapper, record)?;
            return Ok(());
        };
        // The record itself has arrived.
        local.placeholder = false;

        match local.row {
            None if self.policy == MergePolicy::Overwrite => {
                // The remote edit wins over the local deletion.
                let entity = self.mapper.schema().require_entity(&record.record_type)?;
                let row_id = txn.allocate_row_id();
                txn.put_row(resolver::blank_row(entity, row_id, record.record_name()));
                let version = local.cached_record_version.max(1);
                txn.put_record(LocalRecord {
                    version,
                    cached_record_version: version,
                    cached_remote: record.clone(),
                    merge_ancestor: None,
                    row: Some(row_id),
                    ..local
                });
                resolver::write_record(txn, &self.mapper, row_id, record)?;
            }
            None => {
                let mut local = local;
                local.cached_remote = record.clone();
                local.merge_ancestor = None;
                txn.put_record(local);
            }
            Some(row_id) if !local.is_dirty() => {
                resolver::write_record(txn, &self.mapper, row_id, record)?;
                let mut local = local;
                local.cached_remote = record.clone();
                local.merge_ancestor = None;
                txn.put_record(local);
            }
            Some(row_id) => {
                merge::merge_into_row(txn, &self.mapper, self.policy, local, row_id, record.clone())?;
            }
        }
        Ok(())
    }
}
