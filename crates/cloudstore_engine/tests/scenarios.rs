//! End-to-end sync scenarios against the in-memory record store.

use cloudstore_cache::{CommitOrigin, RelationValue};
use cloudstore_codec::{IdentityTransform, ScalarKind, Value};
use cloudstore_engine::{
    AttributeDescriptor, DeleteRule, EntityDescriptor, MergePolicy, PushReconciler,
    RecordMapper, RelationshipDescriptor, Schema, StoreConfig, StoreEvent, SyncError, SyncStore,
};
use cloudstore_protocol::{DatabaseScope, RemoteError, RemoteErrorCode, ZoneId};
use cloudstore_server::{InMemoryRecordStore, RecordStoreClient, ServerConfig};
use std::sync::Arc;
use std::time::Duration;

const CONTAINER: &str = "iCloud.com.example.cloudstore";

fn zone() -> ZoneId {
    ZoneId::new("Family")
}

fn schema() -> Schema {
    Schema::new(vec![
        EntityDescriptor::new("Parent")
            .attribute(AttributeDescriptor::new("name", ScalarKind::String))
            .relationship(
                RelationshipDescriptor::to_many("children", "Child")
                    .with_inverse("parent")
                    .with_delete_rule(DeleteRule::Cascade),
            ),
        EntityDescriptor::new("Child")
            .attribute(AttributeDescriptor::new("name", ScalarKind::String))
            .attribute(AttributeDescriptor::new("age", ScalarKind::Integer64).with_default(0i64))
            .relationship(RelationshipDescriptor::to_one("parent", "Parent").with_inverse("children")),
    ])
    .unwrap()
}

fn config() -> StoreConfig {
    StoreConfig::new(CONTAINER, "Family").with_push_interval(Duration::from_secs(3600))
}

async fn open(client: &Arc<RecordStoreClient>) -> SyncStore {
    let store = SyncStore::open(config(), schema(), client.clone()).unwrap();
    store.wait_idle().await;
    store
}

async fn push(store: &SyncStore) {
    store.push().unwrap().wait().await.unwrap();
    store.wait_idle().await;
}

async fn pull(store: &SyncStore) {
    store.pull().unwrap().wait().await.unwrap();
    store.wait_idle().await;
}

fn name_of(store: &SyncStore, record_name: &str) -> Value {
    store
        .row_for_record(record_name)
        .unwrap()
        .attribute("name")
        .clone()
}

#[tokio::test(start_paused = true)]
async fn created_entity_is_confirmed_by_push() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let client = server.connect(DatabaseScope::Private);
    let store = open(&client).await;

    store
        .save(|ctx| {
            let parent = ctx.insert_named("Parent", "P1")?;
            ctx.set(parent, "name", "A")
        })
        .unwrap();
    let local = store.local_record("P1").unwrap();
    assert_eq!((local.version, local.cached_record_version), (1, 0));
    assert!(local.is_dirty());

    push(&store).await;

    let local = store.local_record("P1").unwrap();
    assert_eq!((local.version, local.cached_record_version), (1, 1));
    assert!(!local.is_dirty());
    assert_eq!(
        server.record(&zone(), "P1").unwrap().scalar("name"),
        Some(&Value::from("A"))
    );

    let mapper = RecordMapper::new(Arc::new(schema()), Arc::new(IdentityTransform));
    let row = store.row_for_record("P1").unwrap();
    let diff = store
        .cache()
        .transaction(CommitOrigin::Maintenance, |txn| {
            mapper.to_remote_diff(&*txn, &row, &local.cached_remote)
        })
        .unwrap();
    assert!(diff.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_push_conflicts_then_resends_local_value() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let client_a = server.connect(DatabaseScope::Private);
    let client_b = server.connect(DatabaseScope::Private);
    let a = open(&client_a).await;
    let b = open(&client_b).await;

    a.save(|ctx| {
        let parent = ctx.insert_named("Parent", "P1")?;
        ctx.set(parent, "name", "X")
    })
    .unwrap();
    push(&a).await;
    pull(&b).await;
    assert_eq!(name_of(&b, "P1"), Value::from("X"));

    a.save(|ctx| {
        let parent = ctx.find("P1").unwrap();
        ctx.set(parent, "name", "A")
    })
    .unwrap();
    push(&a).await;

    b.save(|ctx| {
        let parent = ctx.find("P1").unwrap();
        ctx.set(parent, "name", "B")
    })
    .unwrap();
    let before = b.local_record("P1").unwrap();

    let pusher = PushReconciler::new(
        client_b.clone(),
        Arc::clone(b.cache()),
        Arc::new(RecordMapper::new(Arc::new(schema()), Arc::new(IdentityTransform))),
        MergePolicy::PropertyLocalTrump,
        zone(),
    );
    let report = pusher.push().await.unwrap();
    assert_eq!(report.conflicts, 1);

    let after = b.local_record("P1").unwrap();
    assert_eq!(name_of(&b, "P1"), Value::from("B"));
    assert_eq!(after.version, before.version);
    assert_eq!(after.cached_record_version, before.cached_record_version);
    assert_eq!(after.cached_remote.scalar("name"), Some(&Value::from("A")));
    assert!(after.is_dirty());

    push(&b).await;
    assert_eq!(
        server.record(&zone(), "P1").unwrap().scalar("name"),
        Some(&Value::from("B"))
    );
    assert!(!b.local_record("P1").unwrap().is_dirty());

    pull(&a).await;
    assert_eq!(name_of(&a, "P1"), Value::from("B"));
}

#[tokio::test(start_paused = true)]
async fn conflict_triggers_pull_and_converges() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let client_a = server.connect(DatabaseScope::Private);
    let client_b = server.connect(DatabaseScope::Private);
    let a = open(&client_a).await;
    let b = open(&client_b).await;

    a.save(|ctx| {
        let parent = ctx.insert_named("Parent", "P1")?;
        ctx.set(parent, "name", "X")
    })
    .unwrap();
    push(&a).await;
    pull(&b).await;

    a.save(|ctx| {
        let parent = ctx.find("P1").unwrap();
        ctx.set(parent, "name", "A")
    })
    .unwrap();
    push(&a).await;

    let mut events = b.subscribe_events();
    b.save(|ctx| {
        let parent = ctx.find("P1").unwrap();
        ctx.set(parent, "name", "B")
    })
    .unwrap();
    push(&b).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&StoreEvent::PushFinished {
        saved: 0,
        deleted: 0,
        conflicts: 1
    }));
    assert!(seen.iter().any(|e| matches!(e, StoreEvent::PullFinished { .. })));
    assert!(seen.contains(&StoreEvent::PushFinished {
        saved: 1,
        deleted: 0,
        conflicts: 0
    }));

    assert_eq!(
        server.record(&zone(), "P1").unwrap().scalar("name"),
        Some(&Value::from("B"))
    );
    pull(&a).await;
    assert_eq!(name_of(&a, "P1"), name_of(&b, "P1"));
}

#[tokio::test(start_paused = true)]
async fn unpushed_delete_never_reaches_remote() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let client = server.connect(DatabaseScope::Private);
    let store = open(&client).await;
    let calls = client.modify_calls();

    let row = store
        .save(|ctx| {
            let parent = ctx.insert_named("Parent", "P1")?;
            ctx.set(parent, "name", "A")?;
            Ok(parent)
        })
        .unwrap();
    store.save(|ctx| ctx.delete(row)).unwrap();
    assert!(store.local_record("P1").unwrap().is_tombstone());

    push(&store).await;
    assert_eq!(client.modify_calls(), calls);
    assert!(store.local_record("P1").is_none());
    assert!(server.record(&zone(), "P1").is_none());
}

#[tokio::test(start_paused = true)]
async fn relationships_and_cascade_delete_replicate() {
    let server = InMemoryRecordStore::new(ServerConfig::default().with_page_size(2));
    let client_a = server.connect(DatabaseScope::Private);
    let client_b = server.connect(DatabaseScope::Private);
    let a = open(&client_a).await;
    let b = open(&client_b).await;

    a.save(|ctx| {
        let parent = ctx.insert_named("Parent", "P")?;
        ctx.set(parent, "name", "Pat")?;
        for (name, age) in [("C1", 4i64), ("C2", 7)] {
            let child = ctx.insert_named("Child", name)?;
            ctx.set(child, "name", name)?;
            ctx.set(child, "age", age)?;
            ctx.set_to_one(child, "parent", Some(parent))?;
        }
        Ok(())
    })
    .unwrap();
    push(&a).await;

    let child = server.record(&zone(), "C1").unwrap();
    assert!(child.get("parent").is_some());
    assert!(server.record(&zone(), "P").unwrap().get("children").is_none());

    pull(&b).await;
    assert_eq!(b.fetch("Child").unwrap().len(), 2);
    let parent = b.row_for_record("P").unwrap();
    assert_eq!(parent.attribute("name"), &Value::from("Pat"));
    let children = parent.relationship("children").map(RelationValue::targets);
    assert_eq!(children.map(|c| c.len()), Some(2));
    let c2 = b.row_for_record("C2").unwrap();
    assert_eq!(c2.attribute("age"), &Value::Integer(7));
    assert_eq!(
        c2.relationship("parent"),
        Some(&RelationValue::ToOne(Some(parent.row_id)))
    );

    b.save(|ctx| {
        let parent = ctx.find("P").unwrap();
        ctx.delete(parent)
    })
    .unwrap();
    assert!(b.fetch("Child").unwrap().is_empty());
    push(&b).await;
    assert!(server.records(&zone()).is_empty());
    assert_eq!(b.cache().record_count(), 0);

    pull(&a).await;
    assert!(a.fetch("Parent").unwrap().is_empty());
    assert!(a.fetch("Child").unwrap().is_empty());
    assert_eq!(a.cache().record_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_push_failures_are_bounded() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let client = server.connect(DatabaseScope::Private);
    let store = open(&client).await;
    store
        .save(|ctx| {
            let parent = ctx.insert_named("Parent", "P1")?;
            ctx.set(parent, "name", "A")
        })
        .unwrap();

    for _ in 0..4 {
        client.fail_next(RemoteError::new(RemoteErrorCode::NetworkFailure, "connection reset"));
    }
    let mut events = store.subscribe_events();
    let err = store.push().unwrap().wait().await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(ref e) if e.code == RemoteErrorCode::NetworkFailure));
    assert!(matches!(events.recv().await.unwrap(), StoreEvent::PushFailed { .. }));
    assert!(store.local_record("P1").unwrap().is_dirty());
    assert!(!store.is_pushing());

    push(&store).await;
    assert!(!store.local_record("P1").unwrap().is_dirty());
}

#[tokio::test(start_paused = true)]
async fn server_notification_drives_pull() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let client_a = server.connect(DatabaseScope::Private);
    let client_b = server.connect(DatabaseScope::Private);
    let a = open(&client_a).await;
    let b = open(&client_b).await;
    let mut notifications = server.subscribe_notifications();

    a.save(|ctx| {
        let parent = ctx.insert_named("Parent", "P1")?;
        ctx.set(parent, "name", "A")
    })
    .unwrap();
    push(&a).await;

    let notification = notifications.recv().await.unwrap();
    let payload = serde_json::to_value(&notification).unwrap();
    assert!(b.handle_remote_notification(&payload));
    b.wait_idle().await;
    assert_eq!(name_of(&b, "P1"), Value::from("A"));
}

#[tokio::test(start_paused = true)]
async fn commits_are_announced() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let client = server.connect(DatabaseScope::Private);
    let store = open(&client).await;
    let commits = store.subscribe_commits();

    store
        .save(|ctx| {
            let parent = ctx.insert_named("Parent", "P1")?;
            ctx.set(parent, "name", "A")
        })
        .unwrap();
    push(&store).await;

    let notices: Vec<_> = commits.try_iter().collect();
    assert_eq!(notices[0].origin, CommitOrigin::LocalSave);
    assert_eq!(notices[0].inserted, vec!["P1".to_string()]);
    assert!(notices
        .iter()
        .any(|n| n.origin == CommitOrigin::Push && n.updated.contains(&"P1".to_string())));
}

#[tokio::test(start_paused = true)]
async fn public_scope_reads_without_account() {
    let server = InMemoryRecordStore::new(ServerConfig::default());
    let owner = server.connect(DatabaseScope::Private);
    open(&owner).await;

    let reader = server.connect(DatabaseScope::Public);
    reader.set_account_status(cloudstore_protocol::AccountStatus::NoAccount);
    let store = SyncStore::open(
        config().with_scope(DatabaseScope::Public),
        schema(),
        reader.clone(),
    )
    .unwrap();
    store.wait_idle().await;
    assert!(store.can_read());
    assert!(!store.can_write());
    assert!(store.push().is_none());
}
