//! Configuration for a sync store.

use crate::error::{SyncError, SyncResult};
use cloudstore_codec::{ByteTransform, CompressionAlgorithm, IdentityTransform};
use cloudstore_protocol::{DatabaseScope, ZoneId};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Directory name used when no account identity is known.
pub const LOCAL_ACCOUNT_DIR: &str = "local";

/// File extension of journal files.
pub const JOURNAL_EXTENSION: &str = "journal";

/// How a pulled record is merged into a locally modified one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Per field: local edits win over remote edits.
    #[default]
    PropertyLocalTrump,
    /// Per field: remote edits win over local edits.
    PropertyRemoteTrump,
    /// The remote snapshot replaces local values and clears dirtiness.
    Overwrite,
}

/// Configuration for a sync store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Remote container identifier.
    pub container_id: String,
    /// Database scope within the container.
    pub scope: DatabaseScope,
    /// Name of the zone this store syncs.
    pub zone_name: String,
    /// Merge policy for pulled records with local edits.
    pub merge_policy: MergePolicy,
    /// Transform applied to binary attributes.
    pub transform: Arc<dyn ByteTransform>,
    /// Retry configuration of the operation queue.
    pub retry: RetryPolicy,
    /// Interval of the periodic push.
    pub push_interval: Duration,
    /// Delay before pulling after a remote notification.
    pub notification_pull_delay: Duration,
    /// Delay before pulling after returning to the foreground.
    pub foreground_pull_delay: Duration,
    /// Whether syncing over a cellular-only connection is allowed.
    pub allows_cellular: bool,
    /// Root directory of journal files; `None` keeps the cache in memory.
    pub storage_root: Option<PathBuf>,
    /// Opaque identity token of the signed-in account.
    pub account_token: Option<String>,
}

impl StoreConfig {
    /// Creates a configuration for `zone_name` in `container_id`.
    pub fn new(container_id: impl Into<String>, zone_name: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            scope: DatabaseScope::Private,
            zone_name: zone_name.into(),
            merge_policy: MergePolicy::default(),
            transform: Arc::new(IdentityTransform),
            retry: RetryPolicy::default(),
            push_interval: Duration::from_secs(15),
            notification_pull_delay: Duration::from_secs(1),
            foreground_pull_delay: Duration::from_secs(3),
            allows_cellular: true,
            storage_root: None,
            account_token: None,
        }
    }

    /// Sets the database scope.
    pub fn with_scope(mut self, scope: DatabaseScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the merge policy.
    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Sets the binary attribute transform.
    pub fn with_transform(mut self, transform: Arc<dyn ByteTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the periodic push interval.
    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval = interval;
        self
    }

    /// Sets the pull delay after a remote notification.
    pub fn with_notification_pull_delay(mut self, delay: Duration) -> Self {
        self.notification_pull_delay = delay;
        self
    }

    /// Sets the pull delay after returning to the foreground.
    pub fn with_foreground_pull_delay(mut self, delay: Duration) -> Self {
        self.foreground_pull_delay = delay;
        self
    }

    /// Sets whether a cellular-only connection may be used.
    pub fn with_allows_cellular(mut self, allows: bool) -> Self {
        self.allows_cellular = allows;
        self
    }

    /// Stores the journal under `root` instead of in memory.
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Sets the identity token of the signed-in account.
    pub fn with_account_token(mut self, token: impl Into<String>) -> Self {
        self.account_token = Some(token.into());
        self
    }

    /// Returns the zone identifier.
    pub fn zone_id(&self) -> ZoneId {
        ZoneId::new(self.zone_name.clone())
    }

    /// Returns the identifier of the binary attribute transform.
    pub fn compression(&self) -> CompressionAlgorithm {
        self.transform.algorithm()
    }

    /// Checks the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.zone_name.trim().is_empty() {
            return Err(SyncError::InvalidZone("zone name is empty".into()));
        }
        if self.container_id.trim().is_empty() {
            return Err(SyncError::InvalidZone("container identifier is empty".into()));
        }
        // Both names become path components under the storage root.
        let names = [
            ("zone name", &self.zone_name),
            ("container identifier", &self.container_id),
        ];
        for (what, name) in names {
            if !is_path_component(name) {
                return Err(SyncError::InvalidZone(format!(
                    "{what} {name:?} is not a single path component"
                )));
            }
        }
        if self.push_interval.is_zero() {
            return Err(SyncError::InvalidConfig("push interval must be positive".into()));
        }
        Ok(())
    }

    /// Returns the journal path, or `None` for an in-memory store.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.storage_root.as_deref().map(|root| {
            store_path(
                root,
                self.scope,
                self.account_token.as_deref(),
                &self.container_id,
                &self.zone_name,
            )
        })
    }
}

/// Returns `<root>/<account-dir>/<container>/<zone>.journal`.
///
/// The account directory is derived from the account token for the
/// private database so that caches of different accounts never mix.
pub fn store_path(
    root: &Path,
    scope: DatabaseScope,
    account_token: Option<&str>,
    container_id: &str,
    zone_name: &str,
) -> PathBuf {
    let account_dir = match (scope, account_token) {
        (DatabaseScope::Private, Some(token)) => account_directory(token),
        _ => LOCAL_ACCOUNT_DIR.to_string(),
    };
    root.join(account_dir)
        .join(container_id)
        .join(format!("{zone_name}.{JOURNAL_EXTENSION}"))
}

fn is_path_component(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

fn account_directory(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).hyphenated().to_string().to_uppercase()
}

/// Retry configuration of the operation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How many times a transiently failing operation is retried.
    pub limit: u32,
    /// Backoff used when the error carries no retry delay.
    pub default_backoff: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy.
    pub fn new(limit: u32, default_backoff: Duration) -> Self {
        Self {
            limit,
            default_backoff,
        }
    }

    /// Returns the delay before retrying after `error`.
    pub fn backoff_for(&self, error: &SyncError) -> Duration {
        error.retry_after().unwrap_or(self.default_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(3))
    }
}
