//! Per-entity sync metadata

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Stable `table:id` key joining business rows to their sync metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityRef {
    table: String,
    local_id: String,
}

impl EntityRef {
    /// Build a reference from its parts.
    pub fn new(table: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            local_id: local_id.into(),
        }
    }

    /// Table part (e.g. `entries`)
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Local id part
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The `"<table>:"` prefix used to scope store queries to one table.
    pub fn table_prefix(table: &str) -> String {
        format!("{table}:")
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.local_id)
    }
}

impl FromStr for EntityRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((table, local_id)) = s.split_once(':') else {
            return Err(Error::InvalidEntityRef(s.to_string()));
        };
        if table.is_empty() || local_id.is_empty() {
            return Err(Error::InvalidEntityRef(s.to_string()));
        }
        Ok(Self::new(table, local_id))
    }
}

impl TryFrom<String> for EntityRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityRef> for String {
    fn from(value: EntityRef) -> Self {
        value.to_string()
    }
}

/// Stable per-install identifier of the device that authored a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Device id recorded when the last change was applied from the server.
    pub const REMOTE: &'static str = "remote";

    /// Generate a fresh device id for a new install.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The device id used for changes pulled from the remote.
    #[must_use]
    pub fn remote() -> Self {
        Self(Self::REMOTE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reconciliation state of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local and remote agree as of `last_sync_time`
    Synced,
    /// Local change awaiting push
    Pending,
    /// Local unsent change collided with a remote change
    Conflict,
    /// Last push failed; retried on the next run
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// Whether the local copy holds a change the remote has not acknowledged.
    pub const fn has_unsent_change(self) -> bool {
        matches!(self, Self::Pending | Self::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(Error::Database(format!("unknown sync status '{other}'"))),
        }
    }
}

/// Sync metadata kept for every entity that was ever mutated locally
/// or pulled from the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Primary key, immutable
    pub entity_id: EntityRef,
    /// Last local change (Unix ms)
    pub last_modified: i64,
    /// Device that made the last change
    pub device_id: DeviceId,
    pub status: SyncStatus,
    /// Bumped on every transition to `Pending`
    pub version: u64,
    /// Tombstone: the deletion itself is the pending change
    pub deleted: bool,
    /// Last successful reconciliation (Unix ms)
    pub last_sync_time: Option<i64>,
}

impl SyncRecord {
    /// A record for an entity the tracker has not seen before.
    ///
    /// Starts at version 0 so the first [`SyncRecord::mark_pending`] yields 1.
    pub fn untracked(entity_id: EntityRef, device_id: DeviceId, now_ms: i64) -> Self {
        Self {
            entity_id,
            last_modified: now_ms,
            device_id,
            status: SyncStatus::Pending,
            version: 0,
            deleted: false,
            last_sync_time: None,
        }
    }

    /// A record for an entity first seen through a download.
    pub fn from_remote(entity_id: EntityRef, now_ms: i64) -> Self {
        Self {
            entity_id,
            last_modified: now_ms,
            device_id: DeviceId::remote(),
            status: SyncStatus::Synced,
            version: 1,
            deleted: false,
            last_sync_time: Some(now_ms),
        }
    }

    /// Record a local mutation.
    pub fn mark_pending(&mut self, device_id: &DeviceId, now_ms: i64, deleted: bool) {
        self.last_modified = now_ms;
        self.device_id = device_id.clone();
        self.status = SyncStatus::Pending;
        self.version += 1;
        self.deleted = deleted;
    }

    /// Record a remote snapshot overwriting the local copy.
    pub fn mark_applied_from_remote(&mut self, now_ms: i64) {
        self.last_modified = now_ms;
        self.device_id = DeviceId::remote();
        self.status = SyncStatus::Synced;
        self.deleted = false;
        self.last_sync_time = Some(now_ms);
    }
}
