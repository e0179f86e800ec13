//! Serial queue of network operations.
//!
//! Operations run one at a time in submission order. An operation whose
//! fire time lies in the future is skipped in favour of the next eligible
//! one. A transiently failing operation is rescheduled after a backoff up
//! to the retry limit; every other outcome removes it from the queue.
//!
//! The queue is suspended while the network is unreachable or the app is
//! in the background. Suspension never interrupts a running operation.

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// A unit of network work.
#[async_trait]
pub trait Operation: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one attempt.
    async fn run(&mut self) -> SyncResult<()>;

    /// Called once with the final result, after the last attempt.
    fn finished(&mut self, _result: &SyncResult<()>) {}
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Waiting to run.
    Pending,
    /// Currently running.
    Running,
    /// Failed transiently; waiting for its retry.
    FinishedWithRetry,
    /// Removed from the queue.
    Finished,
}

/// Handle to a queued operation.
#[derive(Debug)]
pub struct OperationHandle {
    id: u64,
    state: Arc<Mutex<OperationState>>,
    done: oneshot::Receiver<SyncResult<()>>,
}

impl OperationHandle {
    /// Returns the queue-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> OperationState {
        *self.state.lock()
    }

    /// Waits for the final result.
    pub async fn wait(self) -> SyncResult<()> {
        self.done.await.map_err(|_| SyncError::QueueClosed)?
    }
}

struct Entry {
    id: u64,
    operation: Box<dyn Operation>,
    retries: u32,
    fire_at: Option<Instant>,
    state: Arc<Mutex<OperationState>>,
    done: Option<oneshot::Sender<SyncResult<()>>>,
}

impl Entry {
    fn set_state(&self, state: OperationState) {
        *self.state.lock() = state;
    }
}

enum Next {
    Run(Entry),
    Wait(Option<Instant>),
    Stop,
}

struct QueueState {
    entries: Vec<Entry>,
    reachable: bool,
    active: bool,
    closed: bool,
}

impl QueueState {
    fn is_suspended(&self) -> bool {
        !self.reachable || !self.active
    }

    fn insert(&mut self, entry: Entry) {
        let position = self.entries.partition_point(|e| e.id < entry.id);
        self.entries.insert(position, entry);
    }

    fn next(&mut self, now: Instant) -> Next {
        if self.closed {
            return Next::Stop;
        }
        if self.is_suspended() {
            return Next::Wait(None);
        }
        let eligible = self
            .entries
            .iter()
            .position(|e| e.fire_at.map_or(true, |at| at <= now));
        match eligible {
            Some(index) => Next::Run(self.entries.remove(index)),
            None => Next::Wait(self.entries.iter().filter_map(|e| e.fire_at).min()),
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

/// Serial operation queue driven by a background task.
pub struct OperationQueue {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl OperationQueue {
    /// Creates a queue and spawns its driver on the current runtime.
    pub fn new(retry: RetryPolicy) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                entries: Vec::new(),
                reachable: true,
                active: true,
                closed: false,
            }),
            wake: Notify::new(),
            retry,
            next_id: AtomicU64::new(1),
        });
        let driver = tokio::spawn(drive(Arc::clone(&shared)));
        Self { shared, driver }
    }

    /// Queues an operation to run as soon as it is its turn.
    pub fn enqueue<O: Operation + 'static>(&self, operation: O) -> OperationHandle {
        self.enqueue_after(operation, Duration::ZERO)
    }

    /// Queues an operation that becomes eligible after `delay`.
    pub fn enqueue_after<O: Operation + 'static>(
        &self,
        operation: O,
        delay: Duration,
    ) -> OperationHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(OperationState::Pending));
        let (tx, rx) = oneshot::channel();
        let fire_at = (!delay.is_zero()).then(|| Instant::now() + delay);
        debug!(operation = operation.name(), id, delay_ms = delay.as_millis() as u64, "operation queued");

        self.shared.state.lock().insert(Entry {
            id,
            operation: Box::new(operation),
            retries: 0,
            fire_at,
            state: Arc::clone(&state),
            done: Some(tx),
        });
        self.shared.wake.notify_one();
        OperationHandle { id, state, done: rx }
    }

    /// Records whether the network is usable.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.state.lock().reachable = reachable;
        self.shared.wake.notify_one();
    }

    /// Records whether the app is in the foreground.
    pub fn set_active(&self, active: bool) {
        self.shared.state.lock().active = active;
        self.shared.wake.notify_one();
    }

    /// Returns true while no operation may start.
    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().is_suspended()
    }

    /// Returns the number of operations waiting, excluding a running one.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Returns true if no operation is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        let entries = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        for mut entry in entries {
            entry.set_state(OperationState::Finished);
            if let Some(done) = entry.done.take() {
                let _ = done.send(Err(SyncError::QueueClosed));
            }
        }
        self.driver.abort();
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        let next = shared.state.lock().next(Instant::now());
        match next {
            Next::Stop => break,
            Next::Run(entry) => run_entry(&shared, entry).await,
            Next::Wait(Some(deadline)) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = sleep_until(deadline) => {}
                }
            }
            Next::Wait(None) => shared.wake.notified().await,
        }
    }
}

async fn run_entry(shared: &Shared, mut entry: Entry) {
    let name = entry.operation.name();
    entry.set_state(OperationState::Running);
    debug!(operation = name, id = entry.id, attempt = entry.retries + 1, "operation started");

    let result = entry.operation.run().await;
    match result {
        Err(err) if err.is_transient() && entry.retries < shared.retry.limit => {
            entry.retries += 1;
            let delay = shared.retry.backoff_for(&err);
            warn!(
                operation = name,
                id = entry.id,
                retry = entry.retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, rescheduling"
            );
            entry.fire_at = Some(Instant::now() + delay);
            entry.set_state(OperationState::FinishedWithRetry);
            shared.state.lock().insert(entry);
        }
        result => {
            match &result {
                Ok(()) => debug!(operation = name, id = entry.id, "operation finished"),
                Err(err) => warn!(operation = name, id = entry.id, error = %err, "operation failed"),
            }
            entry.operation.finished(&result);
            entry.set_state(OperationState::Finished);
            if let Some(done) = entry.done.take() {
                let _ = done.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudstore_protocol::{RemoteError, RemoteErrorCode};
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        failures: Vec<RemoteErrorCode>,
        finished: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                failures: Vec::new(),
                finished: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(mut self, failures: Vec<RemoteErrorCode>) -> Self {
            self.failures = failures;
            self.failures.reverse();
            self
        }
    }

    #[async_trait]
    impl Operation for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&mut self) -> SyncResult<()> {
            self.log.lock().push(self.name);
            match self.failures.pop() {
                Some(code) => Err(RemoteError::new(code, "scripted").into()),
                None => Ok(()),
            }
        }

        fn finished(&mut self, _result: &SyncResult<()>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_submission_order() {
        let queue = OperationQueue::new(RetryPolicy::default());
        let log = log();
        let a = queue.enqueue(Scripted::new("a", &log));
        let b = queue.enqueue(Scripted::new("b", &log));
        let c = queue.enqueue(Scripted::new("c", &log));

        c.wait().await.unwrap();
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_operation_is_skipped() {
        let queue = OperationQueue::new(RetryPolicy::default());
        let log = log();
        let late = queue.enqueue_after(Scripted::new("late", &log), Duration::from_secs(5));
        let now = queue.enqueue(Scripted::new("now", &log));

        now.wait().await.unwrap();
        assert_eq!(late.state(), OperationState::Pending);
        late.wait().await.unwrap();
        assert_eq!(*log.lock(), vec!["now", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_three_times() {
        let queue = OperationQueue::new(RetryPolicy::default());
        let log = log();
        let op = Scripted::new("flaky", &log).failing(vec![RemoteErrorCode::NetworkFailure; 10]);
        let finished = Arc::clone(&op.finished);
        let started = Instant::now();

        let err = queue.enqueue(op).wait().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(log.lock().len(), 4);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(9));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_success() {
        let queue = OperationQueue::new(RetryPolicy::default());
        let log = log();
        let op = Scripted::new("op", &log).failing(vec![
            RemoteErrorCode::ServiceUnavailable,
            RemoteErrorCode::RequestRateLimited,
        ]);
        let handle = queue.enqueue(op);
        handle.wait().await.unwrap();
        assert_eq!(log.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failure_is_not_retried() {
        let queue = OperationQueue::new(RetryPolicy::default());
        let log = log();
        let op = Scripted::new("op", &log).failing(vec![RemoteErrorCode::PermissionFailure]);
        let err = queue.enqueue(op).wait().await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_operation_lets_others_run() {
        let queue = OperationQueue::new(RetryPolicy::new(3, Duration::from_secs(10)));
        let log = log();
        let flaky = queue.enqueue(
            Scripted::new("flaky", &log).failing(vec![RemoteErrorCode::NetworkUnavailable]),
        );
        let other = queue.enqueue(Scripted::new("other", &log));

        other.wait().await.unwrap();
        flaky.wait().await.unwrap();
        assert_eq!(*log.lock(), vec!["flaky", "other", "flaky"]);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_queue_starts_nothing() {
        let queue = OperationQueue::new(RetryPolicy::default());
        let log = log();
        queue.set_reachable(false);
        assert!(queue.is_suspended());
        let handle = queue.enqueue(Scripted::new("op", &log));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(log.lock().is_empty());
        assert_eq!(handle.state(), OperationState::Pending);

        queue.set_active(false);
        queue.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(log.lock().is_empty());

        queue.set_active(true);
        handle.wait().await.unwrap();
        assert_eq!(*log.lock(), vec!["op"]);
    }

    #[tokio::test]
    async fn dropping_the_queue_fails_waiters() {
        let queue = OperationQueue::new(RetryPolicy::default());
        queue.set_reachable(false);
        let handle = queue.enqueue(Scripted::new("op", &log()));
        drop(queue);
        assert!(matches!(handle.wait().await, Err(SyncError::QueueClosed)));
    }
}
