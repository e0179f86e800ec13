//! The sync coordinator.
//!
//! A [`SyncStore`] owns one backing cache mirroring one remote zone. It
//! bootstraps the account and zone, schedules pulls and pushes on the
//! operation queue, and allows at most one of each in flight.
//!
//! ```text
//! open ──► account ──► zone ──► pull ──► subscription
//!                                 │
//!         ┌───────────────────────┘
//!         ▼
//!       push ◄── timer (15 s)        pull ◄── notification (1 s)
//!         │                            ▲        foreground (3 s)
//!         └──── conflicts ─────────────┘
//! ```

use crate::config::StoreConfig;
use crate::context::SaveContext;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, StoreEvent};
use crate::mapper::{DecodedRecord, RecordMapper};
use crate::pull::{PullReconciler, PullReport, PullSession};
use crate::push::{PushReconciler, PushReport};
use crate::queue::{Operation, OperationHandle, OperationQueue};
use crate::schema::Schema;
use async_trait::async_trait;
use cloudstore_cache::{
    BackingCache, CommitNotice, CommitOrigin, EntityRow, LocalRecord, RowId, SyncMetadata,
};
use cloudstore_protocol::{
    AccountStatus, DatabaseScope, RemoteDatabase, RemoteErrorCode, RemoteNotification,
    Subscription, ZoneId, AUTO_UPDATE_SUBSCRIPTION_ID,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether the remote zone can currently be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Account and zone are still being checked.
    Unknown,
    /// No usable account or zone, or no network.
    Unavailable,
    /// The zone can be read.
    Available,
}

#[derive(Debug, Default)]
struct Flags {
    bootstrapping: bool,
    pulling: bool,
    pushing: bool,
}

impl Flags {
    fn is_idle(&self) -> bool {
        !self.bootstrapping && !self.pulling && !self.pushing
    }
}

#[derive(Debug)]
struct AvailabilityState {
    settled: bool,
    account: Option<AccountStatus>,
    zone_ready: bool,
    reachable: bool,
}

impl AvailabilityState {
    fn reset(&mut self) {
        self.settled = false;
        self.account = None;
        self.zone_ready = false;
    }

    fn account_available(&self) -> bool {
        self.account.is_some_and(|status| status.is_available())
    }
}

struct StoreInner {
    config: StoreConfig,
    zone_id: ZoneId,
    cache: Arc<BackingCache>,
    remote: Arc<dyn RemoteDatabase>,
    mapper: Arc<RecordMapper>,
    puller: PullReconciler,
    pusher: PushReconciler,
    queue: OperationQueue,
    events: EventBus,
    flags: Mutex<Flags>,
    idle: Notify,
    availability: Mutex<AvailabilityState>,
    push_timer: Mutex<Option<JoinHandle<()>>>,
    needs_initial_import: AtomicBool,
}

impl StoreInner {
    fn can_read(&self) -> bool {
        let state = self.availability.lock();
        state.zone_ready && (self.config.scope == DatabaseScope::Public || state.account_available())
    }

    fn can_write(&self) -> bool {
        let state = self.availability.lock();
        state.zone_ready && state.account_available()
    }

    fn availability(&self) -> Availability {
        let state = self.availability.lock();
        if !state.settled {
            return Availability::Unknown;
        }
        let readable =
            state.zone_ready && (self.config.scope == DatabaseScope::Public || state.account_available());
        if readable && state.reachable {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }

    fn bootstrap(self: &Arc<Self>) -> OperationHandle {
        self.flags.lock().bootstrapping = true;
        self.queue.enqueue(AccountOperation {
            store: Arc::downgrade(self),
        })
    }

    fn schedule_pull(self: &Arc<Self>, delay: Duration) -> Option<OperationHandle> {
        if !self.can_read() {
            debug!(zone = %self.zone_id, "pull skipped; zone not readable");
            return None;
        }
        {
            let mut flags = self.flags.lock();
            if flags.pulling {
                debug!(zone = %self.zone_id, "pull already in flight");
                return None;
            }
            flags.pulling = true;
        }
        let import = self.needs_initial_import.load(Ordering::SeqCst);
        Some(self.queue.enqueue_after(
            PullOperation {
                store: Arc::downgrade(self),
                session: PullSession::new(),
                import,
                started: false,
                report: None,
            },
            delay,
        ))
    }

    fn schedule_push(self: &Arc<Self>) -> Option<OperationHandle> {
        if !self.can_write() {
            debug!(zone = %self.zone_id, "push skipped; zone not writable");
            return None;
        }
        {
            let mut flags = self.flags.lock();
            if flags.pushing {
                debug!(zone = %self.zone_id, "push already in flight");
                return None;
            }
            flags.pushing = true;
        }
        Some(self.queue.enqueue(PushOperation {
            store: Arc::downgrade(self),
            report: None,
        }))
    }

    fn start_push_timer(self: &Arc<Self>) {
        let mut timer = self.push_timer.lock();
        if timer.is_some() {
            return;
        }
        let store = Arc::downgrade(self);
        let period = self.config.push_interval;
        debug!(zone = %self.zone_id, interval_ms = period.as_millis() as u64, "push timer started");
        *timer = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = store.upgrade() else {
                    break;
                };
                inner.schedule_push();
            }
        }));
    }

    fn stop_push_timer(&self) {
        if let Some(timer) = self.push_timer.lock().take() {
            debug!(zone = %self.zone_id, "push timer stopped");
            timer.abort();
        }
    }

    fn notify_if_idle(&self) {
        if self.flags.lock().is_idle() {
            self.idle.notify_waiters();
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.stop_push_timer();
    }
}

fn upgrade(store: &Weak<StoreInner>) -> SyncResult<Arc<StoreInner>> {
    store.upgrade().ok_or(SyncError::QueueClosed)
}

/// Checks the account and makes sure the zone exists.
struct AccountOperation {
    store: Weak<StoreInner>,
}

#[async_trait]
impl Operation for AccountOperation {
    fn name(&self) -> &'static str {
        "account"
    }

    async fn run(&mut self) -> SyncResult<()> {
        let inner = upgrade(&self.store)?;
        let status = inner.remote.account_status().await?;
        inner.availability.lock().account = Some(status);
        let public = inner.config.scope == DatabaseScope::Public;
        if !status.is_available() && !public {
            return Err(SyncError::Unavailable(format!("account status is {status:?}")));
        }

        if inner.remote.fetch_zone(&inner.zone_id).await?.is_none() {
            if !status.is_available() {
                return Err(SyncError::InvalidZone(format!(
                    "zone {} does not exist and cannot be created without an account",
                    inner.zone_id
                )));
            }
            info!(zone = %inner.zone_id, "creating zone");
            inner.remote.create_zone(&inner.zone_id).await?;
        }
        inner.availability.lock().zone_ready = true;
        Ok(())
    }

    fn finished(&mut self, result: &SyncResult<()>) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        inner.availability.lock().settled = true;
        match result {
            Ok(()) => {
                info!(zone = %inner.zone_id, availability = ?inner.availability(), "account initialized");
                inner.schedule_pull(Duration::ZERO);
                if inner.can_write() {
                    inner.queue.enqueue(SubscriptionOperation {
                        store: Weak::clone(&self.store),
                    });
                    inner.start_push_timer();
                }
                inner.events.emit(StoreEvent::AccountInitialized);
            }
            Err(err) => {
                warn!(zone = %inner.zone_id, error = %err, "account initialization failed");
                inner.events.emit(StoreEvent::AccountFailed {
                    reason: err.to_string(),
                });
            }
        }
        inner.flags.lock().bootstrapping = false;
        inner.notify_if_idle();
    }
}

/// Registers the zone change subscription if it is missing.
struct SubscriptionOperation {
    store: Weak<StoreInner>,
}

#[async_trait]
impl Operation for SubscriptionOperation {
    fn name(&self) -> &'static str {
        "subscription"
    }

    async fn run(&mut self) -> SyncResult<()> {
        let inner = upgrade(&self.store)?;
        match inner.remote.fetch_subscription(AUTO_UPDATE_SUBSCRIPTION_ID).await {
            Ok(_) => Ok(()),
            Err(err) if err.code == RemoteErrorCode::UnknownItem => {
                info!(zone = %inner.zone_id, "registering zone subscription");
                inner
                    .remote
                    .save_subscription(Subscription::auto_update(inner.zone_id.clone()))
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

struct PullOperation {
    store: Weak<StoreInner>,
    session: PullSession,
    import: bool,
    started: bool,
    report: Option<PullReport>,
}

#[async_trait]
impl Operation for PullOperation {
    fn name(&self) -> &'static str {
        "pull"
    }

    async fn run(&mut self) -> SyncResult<()> {
        let inner = upgrade(&self.store)?;
        if self.import && !self.started {
            inner.events.emit(StoreEvent::ImportStarted);
        }
        self.started = true;
        self.report = Some(inner.puller.run(&mut self.session).await?);
        Ok(())
    }

    fn finished(&mut self, result: &SyncResult<()>) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        inner.flags.lock().pulling = false;
        match (result, self.report.take()) {
            (Ok(()), Some(report)) => {
                if self.import {
                    inner.needs_initial_import.store(false, Ordering::SeqCst);
                    inner.events.emit(StoreEvent::ImportFinished);
                }
                inner.events.emit(StoreEvent::PullFinished {
                    changed: report.changed,
                    deleted: report.deleted,
                });
                inner.schedule_push();
            }
            (result, _) => {
                let reason = match result {
                    Err(err) => err.to_string(),
                    Ok(()) => "pull produced no report".to_owned(),
                };
                if self.import {
                    inner.events.emit(StoreEvent::ImportFailed {
                        reason: reason.clone(),
                    });
                }
                inner.events.emit(StoreEvent::PullFailed { reason });
            }
        }
        inner.notify_if_idle();
    }
}

struct PushOperation {
    store: Weak<StoreInner>,
    report: Option<PushReport>,
}

#[async_trait]
impl Operation for PushOperation {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn run(&mut self) -> SyncResult<()> {
        let inner = upgrade(&self.store)?;
        self.report = Some(inner.pusher.push().await?);
        Ok(())
    }

    fn finished(&mut self, result: &SyncResult<()>) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        inner.flags.lock().pushing = false;
        match (result, self.report.take()) {
            (Ok(()), Some(report)) => {
                inner.events.emit(StoreEvent::PushFinished {
                    saved: report.saved,
                    deleted: report.deleted,
                    conflicts: report.conflicts,
                });
                if report.has_conflicts() {
                    info!(zone = %inner.zone_id, conflicts = report.conflicts, "push hit conflicts; pulling");
                    inner.schedule_pull(Duration::ZERO);
                }
            }
            (result, _) => {
                let reason = match result {
                    Err(err) => err.to_string(),
                    Ok(()) => "push produced no report".to_owned(),
                };
                inner.events.emit(StoreEvent::PushFailed { reason });
            }
        }
        inner.notify_if_idle();
    }
}

/// An offline-first store mirroring one remote zone.
///
/// Cloning is cheap; clones share the same cache, queue and state.
#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore")
            .field("container_id", &self.inner.config.container_id)
            .field("zone_id", &self.inner.zone_id)
            .field("availability", &self.inner.availability())
            .finish()
    }
}

impl SyncStore {
    /// Opens the store and starts the account and zone bootstrap.
    ///
    /// Must be called inside a tokio runtime. Local reads and saves work
    /// immediately; syncing starts once the bootstrap succeeds.
    pub fn open(
        config: StoreConfig,
        schema: Schema,
        remote: Arc<dyn RemoteDatabase>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let zone_id = config.zone_id();
        let cache = Arc::new(open_cache(&config)?);

        let metadata = cache.transaction(CommitOrigin::Maintenance, |txn| {
            match txn.metadata().cloned() {
                Some(metadata) if metadata.zone_id != zone_id => Err(SyncError::InvalidZone(format!(
                    "store belongs to zone {}, not {}",
                    metadata.zone_id, zone_id
                ))),
                Some(metadata) => Ok(metadata),
                None => {
                    let metadata = SyncMetadata::new(zone_id.clone());
                    txn.set_metadata(metadata.clone());
                    Ok(metadata)
                }
            }
        })?;

        let mapper = Arc::new(RecordMapper::new(Arc::new(schema), Arc::clone(&config.transform)));
        let puller = PullReconciler::new(
            Arc::clone(&remote),
            Arc::clone(&cache),
            Arc::clone(&mapper),
            config.merge_policy,
            zone_id.clone(),
        );
        let pusher = PushReconciler::new(
            Arc::clone(&remote),
            Arc::clone(&cache),
            Arc::clone(&mapper),
            config.merge_policy,
            zone_id.clone(),
        );
        let queue = OperationQueue::new(config.retry.clone());

        info!(
            container = %config.container_id,
            zone = %zone_id,
            scope = %config.scope,
            store = %metadata.uuid,
            records = cache.record_count(),
            "sync store opened"
        );

        let inner = Arc::new(StoreInner {
            needs_initial_import: AtomicBool::new(metadata.change_token.is_none()),
            config,
            zone_id,
            cache,
            remote,
            mapper,
            puller,
            pusher,
            queue,
            events: EventBus::default(),
            flags: Mutex::new(Flags::default()),
            idle: Notify::new(),
            availability: Mutex::new(AvailabilityState {
                settled: false,
                account: None,
                zone_ready: false,
                reachable: true,
            }),
            push_timer: Mutex::new(None),
        });
        inner.bootstrap();
        Ok(Self { inner })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Schema {
        self.inner.mapper.schema()
    }

    /// Returns the mirrored zone.
    pub fn zone_id(&self) -> &ZoneId {
        &self.inner.zone_id
    }

    /// Returns the backing cache.
    pub fn cache(&self) -> &Arc<BackingCache> {
        &self.inner.cache
    }

    /// Returns the stable identity of this store.
    pub fn store_uuid(&self) -> Option<Uuid> {
        self.inner.cache.metadata().map(|metadata| metadata.uuid)
    }

    /// Runs `f` in one local save.
    ///
    /// Every row changed by `f` gets its version bumped once. Nothing is
    /// written if `f` fails. Changes reach the remote store with the next
    /// push.
    pub fn save<T>(
        &self,
        f: impl FnOnce(&mut SaveContext<'_, '_>) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let inner = &self.inner;
        inner.cache.transaction(CommitOrigin::LocalSave, |txn| {
            let mut ctx = SaveContext::new(txn, inner.mapper.schema(), &inner.zone_id);
            let value = f(&mut ctx)?;
            let bumped = ctx.finish();
            debug!(zone = %inner.zone_id, rows = bumped, "local save");
            Ok(value)
        })
    }

    /// Returns an entity row.
    pub fn row(&self, row_id: RowId) -> Option<EntityRow> {
        self.inner.cache.row(row_id)
    }

    /// Returns the entity row of a record.
    pub fn row_for_record(&self, record_name: &str) -> Option<EntityRow> {
        self.inner.cache.row_for_record(record_name)
    }

    /// Returns all rows of an entity ordered by row id.
    pub fn fetch(&self, entity: &str) -> SyncResult<Vec<EntityRow>> {
        self.schema().require_entity(entity)?;
        Ok(self
            .inner
            .cache
            .rows()
            .into_iter()
            .filter(|row| row.entity == entity)
            .collect())
    }

    /// Returns the sync state of a record.
    pub fn local_record(&self, record_name: &str) -> Option<LocalRecord> {
        self.inner.cache.record(record_name)
    }

    /// Decodes the cached remote copy of a record without touching rows.
    pub fn cached_values(&self, record_name: &str) -> SyncResult<Option<DecodedRecord>> {
        self.inner
            .cache
            .record(record_name)
            .map(|local| self.inner.mapper.from_remote_record(&local.cached_remote))
            .transpose()
    }

    /// Subscribes to cache commits.
    pub fn subscribe_commits(&self) -> Receiver<CommitNotice> {
        self.inner.cache.subscribe()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the current availability.
    pub fn availability(&self) -> Availability {
        self.inner.availability()
    }

    /// Returns true if pulls may run.
    pub fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    /// Returns true if pushes may run.
    pub fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    /// Returns true until the first pull has succeeded.
    pub fn needs_initial_import(&self) -> bool {
        self.inner.needs_initial_import.load(Ordering::SeqCst)
    }

    /// Returns true while a pull is queued or running.
    pub fn is_pulling(&self) -> bool {
        self.inner.flags.lock().pulling
    }

    /// Returns true while a push is queued or running.
    pub fn is_pushing(&self) -> bool {
        self.inner.flags.lock().pushing
    }

    /// Returns true if the push timer is running.
    pub fn is_push_timer_running(&self) -> bool {
        self.inner.push_timer.lock().is_some()
    }

    /// Requests a pull.
    ///
    /// Returns `None` if a pull is already in flight or the zone is not
    /// readable.
    pub fn pull(&self) -> Option<OperationHandle> {
        self.inner.schedule_pull(Duration::ZERO)
    }

    /// Requests a push.
    ///
    /// Returns `None` if a push is already in flight or the zone is not
    /// writable.
    pub fn push(&self) -> Option<OperationHandle> {
        self.inner.schedule_push()
    }

    /// Handles a remote change notification.
    ///
    /// Schedules a short-delayed pull if the payload names this store's
    /// container and zone. Returns true if the payload matched.
    pub fn handle_remote_notification(&self, payload: &serde_json::Value) -> bool {
        let Some(notification) = RemoteNotification::from_payload(payload) else {
            return false;
        };
        if !notification.matches(&self.inner.config.container_id, &self.inner.zone_id) {
            return false;
        }
        debug!(zone = %self.inner.zone_id, "remote change notification");
        self.inner
            .schedule_pull(self.inner.config.notification_pull_delay);
        true
    }

    /// Resumes syncing when the app enters the foreground.
    pub fn did_become_active(&self) {
        self.inner.queue.set_active(true);
        self.inner
            .schedule_pull(self.inner.config.foreground_pull_delay);
        if self.inner.can_write() {
            self.inner.start_push_timer();
        }
    }

    /// Suspends syncing when the app leaves the foreground.
    ///
    /// A running operation finishes; nothing new starts.
    pub fn will_resign_active(&self) {
        self.inner.queue.set_active(false);
        self.inner.stop_push_timer();
    }

    /// Records a reachability change.
    ///
    /// A cellular-only connection counts as unreachable unless the
    /// configuration allows cellular data.
    pub fn set_reachability(&self, reachable: bool, cellular_only: bool) {
        let usable = reachable && (!cellular_only || self.inner.config.allows_cellular);
        debug!(zone = %self.inner.zone_id, reachable, cellular_only, usable, "reachability changed");
        self.inner.availability.lock().reachable = usable;
        self.inner.queue.set_reachable(usable);
    }

    /// Re-runs the account and zone bootstrap after the account changed.
    pub fn account_changed(&self) -> OperationHandle {
        info!(zone = %self.inner.zone_id, "account changed");
        self.inner.stop_push_timer();
        self.inner.availability.lock().reset();
        self.inner.bootstrap()
    }

    /// Waits until no bootstrap, pull or push is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.flags.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

fn open_cache(config: &StoreConfig) -> SyncResult<BackingCache> {
    let Some(path) = config.store_path() else {
        return BackingCache::open_in_memory()
            .map_err(|err| SyncError::UnableToLoadBackingStore(err.to_string()));
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            SyncError::UnableToLoadBackingStore(format!("{}: {err}", parent.display()))
        })?;
    }
    BackingCache::open(&path)
        .map_err(|err| SyncError::UnableToLoadBackingStore(format!("{}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::schema::{AttributeDescriptor, EntityDescriptor};
    use cloudstore_codec::{ScalarKind, Value};
    use cloudstore_protocol::RemoteError;
    use cloudstore_server::{InMemoryRecordStore, RecordStoreClient, ServerConfig};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(vec![EntityDescriptor::new("Parent")
            .attribute(AttributeDescriptor::new("name", ScalarKind::String))])
        .unwrap()
    }

    fn config() -> StoreConfig {
        StoreConfig::new("iCloud.test", "Z")
    }

    fn open(client: &Arc<RecordStoreClient>) -> SyncStore {
        SyncStore::open(config(), schema(), client.clone()).unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<StoreEvent>) -> StoreEvent {
        events.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_creates_zone_and_subscription() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);
        let store = open(&client);
        let mut events = store.subscribe_events();
        assert_eq!(store.availability(), Availability::Unknown);
        assert!(store.needs_initial_import());

        assert_eq!(next_event(&mut events).await, StoreEvent::AccountInitialized);
        store.wait_idle().await;

        assert!(server.has_zone(&ZoneId::new("Z")));
        assert!(server.has_subscription(AUTO_UPDATE_SUBSCRIPTION_ID));
        assert_eq!(store.availability(), Availability::Available);
        assert!(store.is_push_timer_running());
        assert!(!store.needs_initial_import());
        assert!(store.cache().metadata().unwrap().change_token.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_account_fails_bootstrap() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);
        client.set_account_status(AccountStatus::NoAccount);
        let store = open(&client);
        let mut events = store.subscribe_events();

        assert!(matches!(
            next_event(&mut events).await,
            StoreEvent::AccountFailed { .. }
        ));
        store.wait_idle().await;
        assert_eq!(store.availability(), Availability::Unavailable);
        assert!(store.pull().is_none());
        assert!(store.push().is_none());
        assert!(!server.has_zone(&ZoneId::new("Z")));

        client.set_account_status(AccountStatus::Available);
        store.account_changed().wait().await.unwrap();
        store.wait_idle().await;
        assert!(store.can_write());
    }

    #[tokio::test(start_paused = true)]
    async fn second_pull_request_is_a_no_op() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);
        let store = open(&client);
        store.wait_idle().await;

        let first = store.pull().unwrap();
        assert!(store.is_pulling());
        assert!(store.pull().is_none());
        first.wait().await.unwrap();
        store.wait_idle().await;
        assert!(!store.is_pulling());
        assert!(store.pull().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn save_then_timer_push() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);
        let store = open(&client);
        store.wait_idle().await;

        let row = store
            .save(|ctx| {
                let row = ctx.insert_named("Parent", "P1")?;
                ctx.set(row, "name", "A")?;
                Ok(row)
            })
            .unwrap();
        let local = store.local_record("P1").unwrap();
        assert_eq!((local.version, local.cached_record_version), (1, 0));
        assert_eq!(store.row(row).unwrap().attribute("name"), &Value::from("A"));

        tokio::time::sleep(store.config().push_interval + Duration::from_millis(10)).await;
        store.wait_idle().await;

        let local = store.local_record("P1").unwrap();
        assert_eq!((local.version, local.cached_record_version), (1, 1));
        assert!(server.record(&ZoneId::new("Z"), "P1").is_some());
        let cached = store.cached_values("P1").unwrap().unwrap();
        assert_eq!(cached.attributes.get("name"), Some(&Value::from("A")));
    }

    #[tokio::test(start_paused = true)]
    async fn notification_for_own_zone_pulls() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);
        let store = open(&client);
        store.wait_idle().await;
        let calls = client.fetch_changes_calls();

        assert!(!store.handle_remote_notification(&json!({"unrelated": true})));
        assert!(!store.handle_remote_notification(&json!({
            "container_id": "other",
            "zone_id": {"zone_name": "Z", "owner_name": "__defaultOwner__"},
        })));
        let payload = json!({
            "container_id": "iCloud.test",
            "zone_id": serde_json::to_value(ZoneId::new("Z")).unwrap(),
        });
        assert!(store.handle_remote_notification(&payload));
        assert!(store.handle_remote_notification(&payload));
        assert!(store.is_pulling());

        store.wait_idle().await;
        assert_eq!(client.fetch_changes_calls(), calls + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_suspends_queue() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);
        let store = open(&client);
        store.wait_idle().await;

        store.will_resign_active();
        assert!(!store.is_push_timer_running());
        let calls = client.fetch_changes_calls();
        let handle = store.pull().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.fetch_changes_calls(), calls);

        store.did_become_active();
        handle.wait().await.unwrap();
        assert!(store.is_push_timer_running());
        assert_eq!(client.fetch_changes_calls(), calls + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cellular_only_counts_as_unreachable_when_disallowed() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let client = server.connect(DatabaseScope::Private);
        let store = SyncStore::open(
            config().with_allows_cellular(false),
            schema(),
            client.clone(),
        )
        .unwrap();
        store.wait_idle().await;

        store.set_reachability(true, true);
        assert_eq!(store.availability(), Availability::Unavailable);
        store.set_reachability(true, false);
        assert_eq!(store.availability(), Availability::Available);
    }

    /// Delegates to a record store client but fails change fetches.
    struct FailingFeed {
        client: Arc<RecordStoreClient>,
    }

    #[async_trait]
    impl RemoteDatabase for FailingFeed {
        async fn account_status(&self) -> cloudstore_protocol::RemoteResult<AccountStatus> {
            self.client.account_status().await
        }

        async fn fetch_zone(
            &self,
            zone_id: &ZoneId,
        ) -> cloudstore_protocol::RemoteResult<Option<cloudstore_protocol::Zone>> {
            self.client.fetch_zone(zone_id).await
        }

        async fn create_zone(
            &self,
            zone_id: &ZoneId,
        ) -> cloudstore_protocol::RemoteResult<cloudstore_protocol::Zone> {
            self.client.create_zone(zone_id).await
        }

        async fn fetch_zone_changes(
            &self,
            _zone_id: &ZoneId,
            _token: Option<&cloudstore_protocol::ChangeToken>,
        ) -> cloudstore_protocol::RemoteResult<cloudstore_protocol::ZoneChangesPage> {
            Err(RemoteError::new(RemoteErrorCode::ServiceUnavailable, "busy"))
        }

        async fn modify_records(
            &self,
            save: Vec<cloudstore_protocol::Record>,
            delete: Vec<cloudstore_protocol::RecordId>,
        ) -> cloudstore_protocol::RemoteResult<cloudstore_protocol::ModifyResult> {
            self.client.modify_records(save, delete).await
        }

        async fn fetch_subscription(
            &self,
            subscription_id: &str,
        ) -> cloudstore_protocol::RemoteResult<Subscription> {
            self.client.fetch_subscription(subscription_id).await
        }

        async fn save_subscription(
            &self,
            subscription: Subscription,
        ) -> cloudstore_protocol::RemoteResult<Subscription> {
            self.client.save_subscription(subscription).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_pull_reports_import_failure() {
        let server = InMemoryRecordStore::new(ServerConfig::default());
        let remote = Arc::new(FailingFeed {
            client: server.connect(DatabaseScope::Private),
        });
        let store = SyncStore::open(
            config().with_retry(RetryPolicy::new(1, Duration::from_secs(1))),
            schema(),
            remote,
        )
        .unwrap();
        let mut events = store.subscribe_events();

        assert_eq!(next_event(&mut events).await, StoreEvent::AccountInitialized);
        assert_eq!(next_event(&mut events).await, StoreEvent::ImportStarted);
        assert!(matches!(
            next_event(&mut events).await,
            StoreEvent::ImportFailed { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            StoreEvent::PullFailed { .. }
        ));
        store.wait_idle().await;
        assert!(store.needs_initial_import());
        assert!(!store.is_pulling());
    }
}
