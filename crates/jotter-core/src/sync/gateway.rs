//! Remote API abstraction consumed by the sync stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{EntityRef, Entry, EntryId};

/// Failure talking to the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Timeout, refused connection, DNS failure, ... Retried next run.
    #[error("Network error: {0}")]
    Network(String),
    /// Credential rejected. Terminal for the whole cycle.
    #[error("Remote API rejected credentials: {0}")]
    Unauthorized(String),
    /// The remote copy changed after the base the client sent.
    #[error("Remote copy changed since last sync: {0}")]
    Conflict(String),
    /// Any other non-success response
    #[error("Remote API error: {message} ({status})")]
    Rejected { status: u16, message: String },
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
}

impl GatewayError {
    /// Whether the error must abort the sync cycle instead of being recorded
    /// against a single entity.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Identifier the remote assigned to an uploaded entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A journal entry as the remote reports it.
///
/// `deleted` marks a remote tombstone; its `content` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub id: EntryId,
    #[serde(default)]
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteEntity {
    pub fn entity_ref(&self) -> EntityRef {
        self.id.entity_ref()
    }

    /// The local entry this snapshot would be stored as.
    pub fn to_entry(&self) -> Entry {
        Entry {
            id: self.id,
            content: self.content.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            id: entry.id,
            content: entry.content.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            deleted: false,
        }
    }

    pub const fn tombstone(id: EntryId, created_at: i64, deleted_at: i64) -> Self {
        Self {
            id,
            content: String::new(),
            created_at,
            updated_at: deleted_at,
            deleted: true,
        }
    }

    /// Whether `entry` already holds exactly this snapshot.
    pub fn matches(&self, entry: &Entry) -> bool {
        !self.deleted
            && self.id == entry.id
            && self.content == entry.content
            && self.updated_at == entry.updated_at
    }
}

/// Remote journal API.
///
/// `base` is the caller's `last_sync_time` for the entity: implementations
/// answer [`GatewayError::Conflict`] when the remote copy was modified after
/// it. `None` means "never synced" and writes unconditionally.
#[allow(async_fn_in_trait)]
pub trait RemoteGateway {
    /// Create or replace the remote copy of an entry
    async fn create_or_update(&self, entry: &Entry, base: Option<i64>) -> GatewayResult<RemoteId>;

    /// Delete the remote copy. Deleting something already gone succeeds.
    async fn delete(&self, entity: &EntityRef, base: Option<i64>) -> GatewayResult<()>;

    /// Every entity changed after `since` (all of them for `None`), tombstones included
    async fn fetch_changes(&self, since: Option<i64>) -> GatewayResult<Vec<RemoteEntity>>;

    /// Current remote snapshot of one entity, `None` if it never existed
    async fn fetch(&self, entity: &EntityRef) -> GatewayResult<Option<RemoteEntity>>;
}

/// Map an entity reference to the entry id the remote API is keyed by.
pub(crate) fn entry_id_of(entity: &EntityRef) -> GatewayResult<EntryId> {
    EntryId::from_entity_ref(entity).map_err(|error| GatewayError::InvalidPayload(error.to_string()))
}
