//! Commit notifications.
//!
//! Every committed transaction produces one [`CommitNotice`]. A second,
//! domain-facing cache subscribes and replays the listed records to stay in
//! step with the backing cache.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};

/// Who committed a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOrigin {
    /// A local save of domain objects.
    LocalSave,
    /// The pull reconciler applying remote changes.
    Pull,
    /// The push reconciler recording remote outcomes.
    Push,
    /// Store bookkeeping (metadata creation and similar).
    Maintenance,
}

/// Summary of one committed transaction, by record name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    /// Commit sequence number.
    pub sequence: u64,
    /// Who committed.
    pub origin: CommitOrigin,
    /// Records created by the commit.
    pub inserted: Vec<String>,
    /// Records modified by the commit.
    pub updated: Vec<String>,
    /// Records removed by the commit.
    pub deleted: Vec<String>,
}

impl CommitNotice {
    /// Returns true if no record changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Distributes commit notices to subscribers.
///
/// - Emits only committed transactions
/// - Preserves commit order
/// - Drops disconnected subscribers on the next emit
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<CommitNotice>>>,
    history: RwLock<Vec<CommitNotice>>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a feed keeping the last 1000 notices.
    pub fn new() -> Self {
        Self::with_max_history(1000)
    }

    /// Creates a feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to all future notices.
    pub fn subscribe(&self) -> Receiver<CommitNotice> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a notice.
    pub fn emit(&self, notice: CommitNotice) {
        {
            let mut history = self.history.write();
            history.push(notice.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    /// Returns notices with sequence greater than `cursor`.
    pub fn poll(&self, cursor: u64) -> Vec<CommitNotice> {
        self.history
            .read()
            .iter()
            .filter(|n| n.sequence > cursor)
            .cloned()
            .collect()
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(sequence: u64) -> CommitNotice {
        CommitNotice {
            sequence,
            origin: CommitOrigin::Pull,
            inserted: vec![format!("r{sequence}")],
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    #[test]
    fn subscribers_receive_in_order() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        feed.emit(notice(1));
        feed.emit(notice(2));

        assert_eq!(rx.recv().unwrap().sequence, 1);
        assert_eq!(rx.recv().unwrap().sequence, 2);
    }

    #[test]
    fn dropped_subscriber_is_removed() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);

        feed.emit(notice(1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let feed = ChangeFeed::with_max_history(2);
        for seq in 1..=5 {
            feed.emit(notice(seq));
        }
        let polled = feed.poll(0);
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].sequence, 4);
        assert!(feed.poll(5).is_empty());
    }
}
