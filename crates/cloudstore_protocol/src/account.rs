//! Account, zone and subscription types.

use crate::ids::ZoneId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscription id registered for every synced zone.
pub const AUTO_UPDATE_SUBSCRIPTION_ID: &str = "autoUpdate";

/// Status of the user account on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Signed in and usable.
    Available,
    /// No account signed in.
    NoAccount,
    /// Account access restricted by policy.
    Restricted,
    /// Status could not be determined.
    CouldNotDetermine,
}

impl AccountStatus {
    /// Returns true if the account can be used.
    pub fn is_available(&self) -> bool {
        matches!(self, AccountStatus::Available)
    }
}

/// Which database of a container a store syncs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DatabaseScope {
    /// World-readable database.
    Public,
    /// The user's private database.
    #[default]
    Private,
    /// Zones shared with the user.
    Shared,
}

impl fmt::Display for DatabaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatabaseScope::Public => "public",
            DatabaseScope::Private => "private",
            DatabaseScope::Shared => "shared",
        };
        f.write_str(name)
    }
}

/// A zone as known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Zone identity.
    pub zone_id: ZoneId,
}

impl Zone {
    /// Creates a zone description.
    pub fn new(zone_id: ZoneId) -> Self {
        Self { zone_id }
    }
}

/// Registration asking the server to notify on zone changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription id.
    pub subscription_id: String,
    /// Zone being watched.
    pub zone_id: ZoneId,
    /// Deliver silent (content-available) notifications.
    pub content_available: bool,
}

impl Subscription {
    /// Creates the silent zone subscription used for automatic pulls.
    pub fn auto_update(zone_id: ZoneId) -> Self {
        Self {
            subscription_id: AUTO_UPDATE_SUBSCRIPTION_ID.to_string(),
            zone_id,
            content_available: true,
        }
    }
}

/// A push notification announcing changes in a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNotification {
    /// Container the change happened in.
    pub container_id: String,
    /// Changed zone.
    pub zone_id: ZoneId,
    /// Subscription that fired, if known.
    #[serde(default)]
    pub subscription_id: Option<String>,
}

impl RemoteNotification {
    /// Parses a notification from its JSON payload.
    ///
    /// Returns `None` for payloads that are not zone notifications.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    /// Returns true if the notification concerns the given container and zone.
    pub fn matches(&self, container_id: &str, zone_id: &ZoneId) -> bool {
        self.container_id == container_id && &self.zone_id == zone_id
    }
}
