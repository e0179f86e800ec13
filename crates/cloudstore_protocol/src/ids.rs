//! Zone and record identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Owner name used for zones owned by the current user.
pub const DEFAULT_OWNER_NAME: &str = "__defaultOwner__";

/// Identifies a zone: a partition of the remote database with its own
/// change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId {
    /// Zone name.
    pub zone_name: String,
    /// Owner of the zone.
    pub owner_name: String,
}

impl ZoneId {
    /// Creates a zone id owned by the current user.
    pub fn new(zone_name: impl Into<String>) -> Self {
        Self {
            zone_name: zone_name.into(),
            owner_name: DEFAULT_OWNER_NAME.to_string(),
        }
    }

    /// Creates a zone id with an explicit owner.
    pub fn with_owner(zone_name: impl Into<String>, owner_name: impl Into<String>) -> Self {
        Self {
            zone_name: zone_name.into(),
            owner_name: owner_name.into(),
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_name, self.zone_name)
    }
}

/// Identifies a record: a record name unique within its zone.
///
/// Relationship fields hold these instead of embedding whole records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    /// Record name, stable for the lifetime of the record.
    pub record_name: String,
    /// Zone containing the record.
    pub zone_id: ZoneId,
}

impl RecordId {
    /// Creates a record id.
    pub fn new(record_name: impl Into<String>, zone_id: ZoneId) -> Self {
        Self {
            record_name: record_name.into(),
            zone_id,
        }
    }

    /// Creates a record id with a fresh random name.
    pub fn random(zone_id: ZoneId) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string().to_uppercase(), zone_id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.record_name)
    }
}
