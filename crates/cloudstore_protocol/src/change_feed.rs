//! Zone change feed types.

use crate::ids::RecordId;
use crate::record::Record;
use serde::{Deserialize, Serialize};

/// Opaque continuation cursor into a zone's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(pub Vec<u8>);

impl ChangeToken {
    /// Wraps raw token bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ZoneChange {
    /// A record was created or modified; carries its full current state.
    Changed(Record),
    /// A record was deleted.
    Deleted(RecordId),
}

impl ZoneChange {
    /// Returns the id of the affected record.
    pub fn record_id(&self) -> &RecordId {
        match self {
            ZoneChange::Changed(record) => &record.record_id,
            ZoneChange::Deleted(id) => id,
        }
    }
}

/// One page of changes, in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneChangesPage {
    /// Changes in this page.
    pub changes: Vec<ZoneChange>,
    /// Token to pass on the next fetch.
    pub new_token: ChangeToken,
    /// True if more pages follow.
    pub more_coming: bool,
}

impl ZoneChangesPage {
    /// Returns true if the page carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
