//! Lifecycle events of a sync store.

use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Something that happened to a sync store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Account and zone are ready.
    AccountInitialized,
    /// Account or zone setup failed.
    AccountFailed {
        /// Failure description.
        reason: String,
    },
    /// The first pull of a fresh store started.
    ImportStarted,
    /// The first pull of a fresh store completed.
    ImportFinished,
    /// The first pull of a fresh store failed.
    ImportFailed {
        /// Failure description.
        reason: String,
    },
    /// A pull completed.
    PullFinished {
        /// Records inserted or updated.
        changed: usize,
        /// Records deleted.
        deleted: usize,
    },
    /// A pull failed after its retries.
    PullFailed {
        /// Failure description.
        reason: String,
    },
    /// A push completed.
    PushFinished {
        /// Records saved remotely.
        saved: usize,
        /// Records deleted remotely.
        deleted: usize,
        /// Records that hit a version conflict.
        conflicts: usize,
    },
    /// A push failed after its retries.
    PushFailed {
        /// Failure description.
        reason: String,
    },
}

/// Broadcasts [`StoreEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    /// Creates a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Sends an event; without subscribers it is dropped.
    pub fn emit(&self, event: StoreEvent) {
        let _ = self.sender.send(event);
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
