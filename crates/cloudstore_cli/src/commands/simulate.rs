//! Simulate command implementation.
//!
//! Runs several replicas of one store against an in-memory record store,
//! edits overlapping records from every replica, and checks that all
//! replicas converge on the server state.

use cloudstore_codec::{ScalarKind, Value};
use cloudstore_engine::{
    AttributeDescriptor, EntityDescriptor, RetryPolicy, Schema, StoreConfig, StoreEvent,
    SyncResult, SyncStore,
};
use cloudstore_protocol::{DatabaseScope, RemoteError, RemoteErrorCode};
use cloudstore_server::{InMemoryRecordStore, RecordStoreClient, ServerConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info};

const ZONE_NAME: &str = "Notes";

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Number of replicas.
    pub replicas: usize,
    /// Number of edit rounds.
    pub rounds: usize,
    /// Number of distinct records edited.
    pub records: usize,
    /// Server change-feed page size.
    pub page_size: usize,
    /// Fail the first call of every other push.
    pub flaky: bool,
    /// Keep replica journals under this directory instead of memory.
    pub storage: Option<PathBuf>,
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulateResult {
    /// Number of replicas.
    pub replicas: usize,
    /// Rounds run.
    pub rounds: usize,
    /// Local edits made.
    pub edits: usize,
    /// Records on the server at the end.
    pub server_records: usize,
    /// Records saved across all pushes.
    pub saved: usize,
    /// Version conflicts resolved.
    pub conflicts: usize,
    /// Pushes or pulls that failed after retries.
    pub failures: usize,
    /// Records whose replica state differs from the server.
    pub divergent: Vec<String>,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u128,
}

impl SimulateResult {
    /// Returns true if every replica matches the server.
    pub fn converged(&self) -> bool {
        self.divergent.is_empty()
    }
}

struct Replica {
    index: usize,
    store: SyncStore,
    client: Arc<RecordStoreClient>,
    events: broadcast::Receiver<StoreEvent>,
}

/// Runs the simulate command.
pub fn run(options: SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(simulate(&options))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    if !result.converged() {
        return Err(format!("{} records did not converge", result.divergent.len()).into());
    }
    Ok(())
}

fn schema() -> SyncResult<Schema> {
    Schema::new(vec![EntityDescriptor::new("Note")
        .attribute(AttributeDescriptor::new("title", ScalarKind::String))
        .attribute(AttributeDescriptor::new("edits", ScalarKind::Integer64))])
}

fn replica_config(container_id: &str, storage: Option<&Path>, index: usize) -> StoreConfig {
    let config = StoreConfig::new(container_id, ZONE_NAME)
        .with_retry(RetryPolicy::new(3, Duration::from_millis(50)))
        .with_push_interval(Duration::from_secs(3600));
    match storage {
        Some(root) => config.with_storage_root(root.join(format!("replica-{index}"))),
        None => config,
    }
}

async fn simulate(options: &SimulateOptions) -> Result<SimulateResult, Box<dyn std::error::Error>> {
    let started = Instant::now();
    let server = InMemoryRecordStore::new(ServerConfig::default().with_page_size(options.page_size));
    let container_id = server.config().container_id.clone();
    let record_count = options.records.max(1);

    let mut replicas = Vec::with_capacity(options.replicas);
    for index in 0..options.replicas {
        let client = server.connect(DatabaseScope::Private);
        let store = SyncStore::open(
            replica_config(&container_id, options.storage.as_deref(), index),
            schema()?,
            client.clone(),
        )?;
        let events = store.subscribe_events();
        store.wait_idle().await;
        replicas.push(Replica {
            index,
            store,
            client,
            events,
        });
    }
    info!(replicas = replicas.len(), "replicas ready");

    let mut result = SimulateResult {
        replicas: replicas.len(),
        rounds: options.rounds,
        edits: 0,
        server_records: 0,
        saved: 0,
        conflicts: 0,
        failures: 0,
        divergent: Vec::new(),
        elapsed_ms: 0,
    };

    for round in 0..options.rounds {
        for replica in &replicas {
            edit(replica, round, record_count)?;
            result.edits += 1;
        }
        for replica in &replicas {
            if options.flaky && round % 2 == 1 {
                replica.client.fail_next(RemoteError::new(
                    RemoteErrorCode::NetworkFailure,
                    "simulated network failure",
                ));
            }
            push(replica).await;
        }
        for replica in &mut replicas {
            pull(replica).await;
            drain_events(replica, &mut result);
        }
        debug!(round, "round finished");
    }

    // Settle: one more push and pull pass so every follow-up lands everywhere.
    for replica in &replicas {
        push(replica).await;
    }
    for replica in &mut replicas {
        pull(replica).await;
        drain_events(replica, &mut result);
    }

    let zone_id = replicas
        .first()
        .map(|r| r.store.zone_id().clone())
        .unwrap_or_else(|| cloudstore_protocol::ZoneId::new(ZONE_NAME));
    let server_records = server.records(&zone_id);
    result.server_records = server_records.len();

    for replica in &replicas {
        for record in &server_records {
            let name = record.record_name();
            let local = replica.store.local_record(name);
            let tag_matches = local
                .as_ref()
                .is_some_and(|l| l.cached_remote.change_tag == record.change_tag && !l.is_dirty());
            let title = replica
                .store
                .row_for_record(name)
                .map(|row| row.attribute("title").clone())
                .unwrap_or(Value::Null);
            let remote_title = replica
                .store
                .cached_values(name)?
                .and_then(|decoded| decoded.attributes.get("title").cloned())
                .unwrap_or(Value::Null);
            if !tag_matches || title != remote_title {
                result.divergent.push(format!("replica-{}/{}", replica.index, name));
            }
        }
    }

    result.elapsed_ms = started.elapsed().as_millis();
    Ok(result)
}

fn edit(replica: &Replica, round: usize, record_count: usize) -> SyncResult<()> {
    let name = format!("note-{}", (round + replica.index) % record_count);
    let title = format!("round {round} by replica {}", replica.index);
    replica.store.save(|ctx| {
        let row = match ctx.find(&name) {
            Some(row) => row,
            None => ctx.insert_named("Note", &name)?,
        };
        let edits = ctx.get(row, "edits")?.as_i64().unwrap_or(0);
        ctx.set(row, "title", title.as_str())?;
        ctx.set(row, "edits", edits + 1)
    })
}

async fn push(replica: &Replica) {
    if let Some(handle) = replica.store.push() {
        if let Err(err) = handle.wait().await {
            debug!(replica = replica.index, error = %err, "push failed");
        }
    }
    replica.store.wait_idle().await;
}

async fn pull(replica: &Replica) {
    if let Some(handle) = replica.store.pull() {
        if let Err(err) = handle.wait().await {
            debug!(replica = replica.index, error = %err, "pull failed");
        }
    }
    replica.store.wait_idle().await;
}

fn drain_events(replica: &mut Replica, result: &mut SimulateResult) {
    loop {
        match replica.events.try_recv() {
            Ok(StoreEvent::PushFinished {
                saved, conflicts, ..
            }) => {
                result.saved += saved;
                result.conflicts += conflicts;
            }
            Ok(StoreEvent::PushFailed { .. }) | Ok(StoreEvent::PullFailed { .. }) => {
                result.failures += 1;
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

fn print_text_output(result: &SimulateResult) {
    println!("Sync Simulation");
    println!("===============");
    println!();
    println!("Replicas:       {}", result.replicas);
    println!("Rounds:         {}", result.rounds);
    println!("Local edits:    {}", result.edits);
    println!("Server records: {}", result.server_records);
    println!("Saved:          {}", result.saved);
    println!("Conflicts:      {}", result.conflicts);
    println!("Failures:       {}", result.failures);
    println!("Elapsed:        {} ms", result.elapsed_ms);
    println!();

    if result.converged() {
        println!("All replicas converged.");
    } else {
        println!("Divergent records:");
        for name in &result.divergent {
            println!("  {name}");
        }
    }
}
