//! The in-memory record store and its client connections.

use crate::config::ServerConfig;
use crate::zone_log::ZoneLog;
use async_trait::async_trait;
use cloudstore_protocol::{
    AccountStatus, ChangeToken, DatabaseScope, ModifyResult, Record, RecordId, RecordOutcome,
    RemoteDatabase, RemoteError, RemoteErrorCode, RemoteNotification, RemoteResult, Subscription,
    Zone, ZoneChangesPage, ZoneId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ServerState {
    zones: BTreeMap<ZoneId, ZoneLog>,
    subscriptions: BTreeMap<String, Subscription>,
}

/// Reference remote record store held entirely in memory.
///
/// Devices talk to it through [`RecordStoreClient`] handles obtained from
/// [`connect`](Self::connect); every handle sees the same zones, but has
/// its own account status, reachability and injected faults.
///
/// ```
/// use cloudstore_protocol::DatabaseScope;
/// use cloudstore_server::{InMemoryRecordStore, ServerConfig};
///
/// let server = InMemoryRecordStore::new(ServerConfig::default());
/// let device_a = server.connect(DatabaseScope::Private);
/// let device_b = server.connect(DatabaseScope::Private);
/// # let _ = (device_a, device_b);
/// ```
pub struct InMemoryRecordStore {
    config: ServerConfig,
    state: Mutex<ServerState>,
    notifications: broadcast::Sender<RemoteNotification>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(config.notification_capacity);
        Arc::new(Self {
            config,
            state: Mutex::new(ServerState::default()),
            notifications,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Opens a client connection for one device.
    pub fn connect(self: &Arc<Self>, scope: DatabaseScope) -> Arc<RecordStoreClient> {
        Arc::new(RecordStoreClient {
            server: Arc::clone(self),
            scope,
            faults: Mutex::new(Faults::default()),
            modify_calls: AtomicUsize::new(0),
            fetch_changes_calls: AtomicUsize::new(0),
        })
    }

    /// Receives a notification for every modify batch touching a
    /// subscribed zone.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<RemoteNotification> {
        self.notifications.subscribe()
    }

    /// Returns the server copy of a record.
    pub fn record(&self, zone_id: &ZoneId, record_name: &str) -> Option<Record> {
        let state = self.state.lock();
        state.zones.get(zone_id)?.record(record_name).cloned()
    }

    /// Returns all records of a zone.
    pub fn records(&self, zone_id: &ZoneId) -> Vec<Record> {
        let state = self.state.lock();
        state
            .zones
            .get(zone_id)
            .map(ZoneLog::records)
            .unwrap_or_default()
    }

    /// Returns true if the zone exists.
    pub fn has_zone(&self, zone_id: &ZoneId) -> bool {
        self.state.lock().zones.contains_key(zone_id)
    }

    /// Returns true if a subscription with this id exists.
    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        self.state.lock().subscriptions.contains_key(subscription_id)
    }

    fn modify(&self, saves: Vec<Record>, deletes: Vec<RecordId>) -> ModifyResult {
        let mut outcomes = Vec::with_capacity(saves.len() + deletes.len());
        let mut touched = BTreeSet::new();
        let mut state = self.state.lock();

        for record in saves {
            let record_id = record.record_id.clone();
            let outcome = match state.zones.get_mut(&record_id.zone_id) {
                Some(zone) => zone.save(record),
                None => Err(zone_not_found(&record_id.zone_id)),
            };
            outcomes.push(match outcome {
                Ok(saved) => {
                    touched.insert(record_id.zone_id);
                    RecordOutcome::Saved(saved)
                }
                Err(error) => RecordOutcome::Failed { record_id, error },
            });
        }

        for record_id in deletes {
            let outcome = match state.zones.get_mut(&record_id.zone_id) {
                Some(zone) => zone.delete(&record_id),
                None => Err(zone_not_found(&record_id.zone_id)),
            };
            outcomes.push(match outcome {
                Ok(()) => {
                    touched.insert(record_id.zone_id.clone());
                    RecordOutcome::Deleted(record_id)
                }
                Err(error) => RecordOutcome::Failed { record_id, error },
            });
        }

        for subscription in state.subscriptions.values() {
            if touched.contains(&subscription.zone_id) {
                // No receivers is fine.
                let _ = self.notifications.send(RemoteNotification {
                    container_id: self.config.container_id.clone(),
                    zone_id: subscription.zone_id.clone(),
                    subscription_id: Some(subscription.subscription_id.clone()),
                });
            }
        }

        ModifyResult { outcomes }
    }
}

#[derive(Debug)]
struct Faults {
    account_status: AccountStatus,
    reachable: bool,
    fail_next: VecDeque<RemoteError>,
    rejections: BTreeMap<String, RemoteError>,
    latency: Option<Duration>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            account_status: AccountStatus::Available,
            reachable: true,
            fail_next: VecDeque::new(),
            rejections: BTreeMap::new(),
            latency: None,
        }
    }
}

/// One device's connection to an [`InMemoryRecordStore`].
pub struct RecordStoreClient {
    server: Arc<InMemoryRecordStore>,
    scope: DatabaseScope,
    faults: Mutex<Faults>,
    modify_calls: AtomicUsize,
    fetch_changes_calls: AtomicUsize,
}

impl RecordStoreClient {
    /// Returns the server this client talks to.
    pub fn server(&self) -> &Arc<InMemoryRecordStore> {
        &self.server
    }

    /// Sets the account status reported to this device.
    pub fn set_account_status(&self, status: AccountStatus) {
        self.faults.lock().account_status = status;
    }

    /// Makes every call fail with `NetworkUnavailable` while unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.faults.lock().reachable = reachable;
    }

    /// Fails the next call with `error`; queued errors are used in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.faults.lock().fail_next.push_back(error);
    }

    /// Fails the next write of `record_name` with `error`.
    ///
    /// Only that record's outcome fails; the rest of its batch is applied.
    pub fn reject_record(&self, record_name: impl Into<String>, error: RemoteError) {
        self.faults.lock().rejections.insert(record_name.into(), error);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Number of `modify_records` calls that reached the client.
    pub fn modify_calls(&self) -> usize {
        self.modify_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_zone_changes` calls that reached the client.
    pub fn fetch_changes_calls(&self) -> usize {
        self.fetch_changes_calls.load(Ordering::SeqCst)
    }

    async fn begin_call(&self, needs_account: bool) -> RemoteResult<()> {
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        if !faults.reachable {
            return Err(RemoteError::new(
                RemoteErrorCode::NetworkUnavailable,
                "network unreachable",
            ));
        }
        if let Some(error) = faults.fail_next.pop_front() {
            debug!(code = %error.code, "injecting remote failure");
            return Err(error);
        }
        if needs_account && !faults.account_status.is_available() {
            return Err(RemoteError::new(
                RemoteErrorCode::NotAuthenticated,
                "no account signed in",
            ));
        }
        Ok(())
    }

    fn reads_need_account(&self) -> bool {
        self.scope != DatabaseScope::Public
    }
}

#[async_trait]
impl RemoteDatabase for RecordStoreClient {
    async fn account_status(&self) -> RemoteResult<AccountStatus> {
        self.begin_call(false).await?;
        Ok(self.faults.lock().account_status)
    }

    async fn fetch_zone(&self, zone_id: &ZoneId) -> RemoteResult<Option<Zone>> {
        self.begin_call(self.reads_need_account()).await?;
        let state = self.server.state.lock();
        Ok(state
            .zones
            .contains_key(zone_id)
            .then(|| Zone::new(zone_id.clone())))
    }

    async fn create_zone(&self, zone_id: &ZoneId) -> RemoteResult<Zone> {
        self.begin_call(true).await?;
        let mut state = self.server.state.lock();
        state.zones.entry(zone_id.clone()).or_insert_with(|| {
            info!(zone = %zone_id, "created zone");
            ZoneLog::new(zone_id.clone())
        });
        Ok(Zone::new(zone_id.clone()))
    }

    async fn fetch_zone_changes(
        &self,
        zone_id: &ZoneId,
        since: Option<&ChangeToken>,
    ) -> RemoteResult<ZoneChangesPage> {
        self.fetch_changes_calls.fetch_add(1, Ordering::SeqCst);
        self.begin_call(self.reads_need_account()).await?;
        let state = self.server.state.lock();
        let zone = state
            .zones
            .get(zone_id)
            .ok_or_else(|| zone_not_found(zone_id))?;
        zone.changes_since(since, self.server.config.page_size)
    }

    async fn modify_records(
        &self,
        saves: Vec<Record>,
        deletes: Vec<RecordId>,
    ) -> RemoteResult<ModifyResult> {
        self.modify_calls.fetch_add(1, Ordering::SeqCst);
        self.begin_call(true).await?;

        let mut rejected = BTreeMap::new();
        {
            let mut faults = self.faults.lock();
            let names = saves
                .iter()
                .map(Record::record_name)
                .chain(deletes.iter().map(|id| id.record_name.as_str()));
            for name in names {
                if let Some(error) = faults.rejections.remove(name) {
                    rejected.insert(name.to_owned(), error);
                }
            }
        }
        if rejected.is_empty() {
            let result = self.server.modify(saves, deletes);
            debug!(
                saved = result.saved_ids().len(),
                deleted = result.deleted_ids().len(),
                failed = result.has_failures(),
                "modify batch"
            );
            return Ok(result);
        }

        let submitted: Vec<RecordId> = saves
            .iter()
            .map(|record| record.record_id.clone())
            .chain(deletes.iter().cloned())
            .collect();
        let saves = saves
            .into_iter()
            .filter(|record| !rejected.contains_key(record.record_name()))
            .collect();
        let deletes = deletes
            .into_iter()
            .filter(|id| !rejected.contains_key(&id.record_name))
            .collect();
        let mut applied = self.server.modify(saves, deletes).outcomes.into_iter();
        let outcomes = submitted
            .into_iter()
            .filter_map(|record_id| match rejected.remove(&record_id.record_name) {
                Some(error) => Some(RecordOutcome::Failed { record_id, error }),
                None => applied.next(),
            })
            .collect();
        let result = ModifyResult { outcomes };
        debug!(
            saved = result.saved_ids().len(),
            deleted = result.deleted_ids().len(),
            failed = result.has_failures(),
            "modify batch"
        );
        Ok(result)
    }

    async fn fetch_subscription(&self, subscription_id: &str) -> RemoteResult<Subscription> {
        self.begin_call(self.reads_need_account()).await?;
        let state = self.server.state.lock();
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                RemoteError::new(
                    RemoteErrorCode::UnknownItem,
                    format!("subscription {subscription_id} not found"),
                )
            })
    }

    async fn save_subscription(&self, subscription: Subscription) -> RemoteResult<Subscription> {
        self.begin_call(true).await?;
        let mut state = self.server.state.lock();
        if !state.zones.contains_key(&subscription.zone_id) {
            return Err(zone_not_found(&subscription.zone_id));
        }
        state
            .subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(subscription)
    }
}

fn zone_not_found(zone_id: &ZoneId) -> RemoteError {
    RemoteError::new(
        RemoteErrorCode::ZoneNotFound,
        format!("zone {zone_id} not found"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudstore_codec::Value;

    fn zone() -> ZoneId {
        ZoneId::new("Notes")
    }

    async fn ready() -> (Arc<InMemoryRecordStore>, Arc<RecordStoreClient>) {
        let server = InMemoryRecordStore::new(ServerConfig::new("c").with_page_size(2));
        let client = server.connect(DatabaseScope::Private);
        client.create_zone(&zone()).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn zone_lifecycle() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);

        assert!(client.fetch_zone(&zone()).await.unwrap().is_none());
        client.create_zone(&zone()).await.unwrap();
        assert!(client.fetch_zone(&zone()).await.unwrap().is_some());
        assert!(server.has_zone(&zone()));
    }

    #[tokio::test]
    async fn partial_batch_outcomes() {
        let (server, client) = ready().await;
        let good = Record::new("Note", RecordId::new("a", zone())).with_field("t", Value::from(1));
        let missing = RecordId::new("ghost", zone());

        let result = client
            .modify_records(vec![good], vec![missing.clone()])
            .await
            .unwrap();

        assert_eq!(result.outcomes.len(), 2);
        assert!(matches!(&result.outcomes[0], RecordOutcome::Saved(r) if r.change_tag.is_some()));
        assert!(matches!(
            &result.outcomes[1],
            RecordOutcome::Failed { record_id, error }
                if record_id == &missing && error.code == RemoteErrorCode::UnknownItem
        ));
        assert!(server.record(&zone(), "a").is_some());
    }

    #[tokio::test]
    async fn rejected_record_fails_alone() {
        let (server, client) = ready().await;
        let a = Record::new("Note", RecordId::new("a", zone())).with_field("t", Value::from(1));
        let b = Record::new("Note", RecordId::new("b", zone())).with_field("t", Value::from(2));
        client.reject_record(
            "a",
            RemoteError::new(RemoteErrorCode::PermissionFailure, "read only"),
        );

        let result = client.modify_records(vec![a.clone(), b], Vec::new()).await.unwrap();
        assert_eq!(result.outcomes.len(), 2);
        assert!(matches!(
            &result.outcomes[0],
            RecordOutcome::Failed { record_id, error }
                if record_id.record_name == "a" && error.code == RemoteErrorCode::PermissionFailure
        ));
        assert!(matches!(&result.outcomes[1], RecordOutcome::Saved(r) if r.record_name() == "b"));
        assert!(server.record(&zone(), "a").is_none());

        // Used once.
        client.modify_records(vec![a], Vec::new()).await.unwrap();
        assert!(server.record(&zone(), "a").is_some());
    }

    #[tokio::test]
    async fn unreachable_client_fails_transiently() {
        let (_server, client) = ready().await;
        client.set_reachable(false);
        let err = client.fetch_zone_changes(&zone(), None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.fetch_changes_calls(), 1);

        client.set_reachable(true);
        assert!(client.fetch_zone_changes(&zone(), None).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_are_used_once() {
        let (_server, client) = ready().await;
        client.fail_next(
            RemoteError::new(RemoteErrorCode::RequestRateLimited, "slow")
                .with_retry_after(Duration::from_secs(2)),
        );
        let err = client.account_status().await.unwrap_err();
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(client.account_status().await.unwrap(), AccountStatus::Available);
    }

    #[tokio::test]
    async fn writes_require_account() {
        let (_server, client) = ready().await;
        client.set_account_status(AccountStatus::NoAccount);
        let err = client.modify_records(Vec::new(), Vec::new()).await.unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::NotAuthenticated);
        assert_eq!(client.modify_calls(), 1);
    }

    #[tokio::test]
    async fn public_reads_skip_account() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let admin = server.connect(DatabaseScope::Private);
        admin.create_zone(&zone()).await.unwrap();

        let anonymous = server.connect(DatabaseScope::Public);
        anonymous.set_account_status(AccountStatus::NoAccount);
        assert!(anonymous.fetch_zone_changes(&zone(), None).await.is_ok());
    }

    #[tokio::test]
    async fn modify_notifies_subscribers() {
        let (server, client) = ready().await;
        let mut rx = server.subscribe_notifications();
        client
            .save_subscription(Subscription::auto_update(zone()))
            .await
            .unwrap();
        assert!(client.fetch_subscription("autoUpdate").await.is_ok());

        client
            .modify_records(vec![Record::new("Note", RecordId::new("a", zone()))], Vec::new())
            .await
            .unwrap();

        let note = rx.recv().await.unwrap();
        assert!(note.matches("c", &zone()));
        assert_eq!(note.subscription_id.as_deref(), Some("autoUpdate"));
    }

    #[tokio::test]
    async fn missing_subscription_is_unknown_item() {
        let (_server, client) = ready().await;
        let err = client.fetch_subscription("autoUpdate").await.unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::UnknownItem);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_calls() {
        let (_server, client) = ready().await;
        client.set_latency(Some(Duration::from_secs(5)));
        let start = tokio::time::Instant::now();
        client.account_status().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
