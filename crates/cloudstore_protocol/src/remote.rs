//! The remote database contract.

use crate::account::{AccountStatus, Subscription, Zone};
use crate::change_feed::{ChangeToken, ZoneChangesPage};
use crate::error::{RemoteError, RemoteResult};
use crate::ids::{RecordId, ZoneId};
use crate::record::Record;
use async_trait::async_trait;

/// Outcome of one record in a modify batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The record was saved; carries the server-confirmed copy.
    Saved(Record),
    /// The record was deleted.
    Deleted(RecordId),
    /// The save or delete of this record failed.
    Failed {
        /// Record the failure applies to.
        record_id: RecordId,
        /// Why it failed.
        error: RemoteError,
    },
}

impl RecordOutcome {
    /// Returns the id of the affected record.
    pub fn record_id(&self) -> &RecordId {
        match self {
            RecordOutcome::Saved(record) => &record.record_id,
            RecordOutcome::Deleted(id) => id,
            RecordOutcome::Failed { record_id, .. } => record_id,
        }
    }
}

/// Per-record results of a modify batch.
///
/// Batches are never rolled back as a whole: each outcome stands on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifyResult {
    /// One outcome per submitted record, in submission order.
    pub outcomes: Vec<RecordOutcome>,
}

impl ModifyResult {
    /// Ids of saved records.
    pub fn saved_ids(&self) -> Vec<&RecordId> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                RecordOutcome::Saved(r) => Some(&r.record_id),
                _ => None,
            })
            .collect()
    }

    /// Ids of deleted records.
    pub fn deleted_ids(&self) -> Vec<&RecordId> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                RecordOutcome::Deleted(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Returns true if any record failed.
    pub fn has_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o, RecordOutcome::Failed { .. }))
    }
}

/// Client contract of the remote record store.
///
/// Whole-call failures (for example no network) are returned as `Err`;
/// per-record failures of a modify batch are reported inside
/// [`ModifyResult`].
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Returns the status of the current account.
    async fn account_status(&self) -> RemoteResult<AccountStatus>;

    /// Fetches a zone; `None` if it does not exist.
    async fn fetch_zone(&self, zone_id: &ZoneId) -> RemoteResult<Option<Zone>>;

    /// Creates a zone, returning the existing one if already present.
    async fn create_zone(&self, zone_id: &ZoneId) -> RemoteResult<Zone>;

    /// Fetches the next page of changes after `since` (from the start if `None`).
    async fn fetch_zone_changes(
        &self,
        zone_id: &ZoneId,
        since: Option<&ChangeToken>,
    ) -> RemoteResult<ZoneChangesPage>;

    /// Saves and deletes records in one batch.
    async fn modify_records(
        &self,
        saves: Vec<Record>,
        deletes: Vec<RecordId>,
    ) -> RemoteResult<ModifyResult>;

    /// Fetches a subscription by id; fails with `UnknownItem` if absent.
    async fn fetch_subscription(&self, subscription_id: &str) -> RemoteResult<Subscription>;

    /// Creates or replaces a subscription.
    async fn save_subscription(&self, subscription: Subscription) -> RemoteResult<Subscription>;
}
