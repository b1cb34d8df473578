//! Explicit, user-driven conflict resolution.

use serde::{Deserialize, Serialize};

use super::gateway::RemoteGateway;
use super::tracker::ChangeTracker;
use super::upload::{push_record, PushOutcome};
use crate::error::{Error, Result};
use crate::models::{EntityRef, EntryId, SyncRecord, SyncStatus};
use crate::services::JournalDatabase;

/// How to settle a conflict. Resolution is always whole-record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Keep the local copy (or local deletion) and overwrite the remote
    LocalWins,
    /// Take the remote copy (or remote deletion)
    RemoteWins,
    /// Store this merged content locally, then push it like `LocalWins`
    Manual(String),
}

/// Where a resolved entity ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Both sides now agree
    Synced,
    /// The local decision is stored and `Pending`; the push failed and is
    /// retried by the next upload
    Deferred(String),
    /// Both sides agree the entity is deleted; the record is gone
    Purged,
}

pub struct ConflictResolver<'a, G> {
    db: &'a JournalDatabase,
    gateway: &'a G,
    tracker: &'a ChangeTracker,
}

impl<'a, G: RemoteGateway> ConflictResolver<'a, G> {
    pub const fn new(db: &'a JournalDatabase, gateway: &'a G, tracker: &'a ChangeTracker) -> Self {
        Self {
            db,
            gateway,
            tracker,
        }
    }

    /// Resolve the conflict on `entity` with `strategy`.
    ///
    /// Fails with [`Error::NotInConflict`] when the entity has no open conflict.
    pub async fn resolve(&self, entity: &EntityRef, strategy: ConflictStrategy) -> Result<Resolution> {
        let record = self
            .db
            .record(entity)
            .await?
            .filter(|record| record.status == SyncStatus::Conflict)
            .ok_or_else(|| Error::NotInConflict(entity.to_string()))?;

        let resolution = match strategy {
            ConflictStrategy::LocalWins => self.keep_local(record).await?,
            ConflictStrategy::RemoteWins => self.take_remote(record).await?,
            ConflictStrategy::Manual(content) => self.write_merged(record, &content).await?,
        };

        tracing::info!("Resolved conflict on {entity}: {resolution:?}");
        Ok(resolution)
    }

    async fn keep_local(&self, record: SyncRecord) -> Result<Resolution> {
        match self.force_push(&record).await? {
            Ok(resolution) => Ok(resolution),
            Err(message) => {
                self.db
                    .requeue_resolved(&record.entity_id, self.tracker)
                    .await?;
                Ok(Resolution::Deferred(message))
            }
        }
    }

    async fn take_remote(&self, record: SyncRecord) -> Result<Resolution> {
        let remote = self.gateway.fetch(&record.entity_id).await?;

        let settled = match remote.filter(|remote| !remote.deleted) {
            Some(remote) => {
                let mut synced = record.clone();
                synced.mark_applied_from_remote(self.tracker.now());
                self.db
                    .apply_remote_snapshot(&remote.to_entry(), Some(&record), &synced)
                    .await?
                    .then_some(Resolution::Synced)
            }
            None => self
                .db
                .purge_entity(&record.entity_id, Some(&record))
                .await?
                .then_some(Resolution::Purged),
        };

        // A local edit during the fetch wins; it is Pending and will be
        // pushed (or conflict again) on the next sync.
        Ok(settled.unwrap_or_else(|| {
            Resolution::Deferred(format!(
                "{} changed locally during resolution",
                record.entity_id
            ))
        }))
    }

    async fn write_merged(&self, record: SyncRecord, content: &str) -> Result<Resolution> {
        if content.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Merged content cannot be empty".to_string(),
            ));
        }

        let id = EntryId::from_entity_ref(&record.entity_id)?;
        let (_, merged) = self
            .db
            .write_merged_tracked(&id, content, self.tracker)
            .await?;

        match self.force_push(&merged).await? {
            Ok(resolution) => Ok(resolution),
            Err(message) => Ok(Resolution::Deferred(message)),
        }
    }

    /// Push `record` without a precondition so the local side overwrites the
    /// remote. The inner `Err` carries a non-fatal failure message.
    async fn force_push(&self, record: &SyncRecord) -> Result<std::result::Result<Resolution, String>> {
        let outcome = push_record(
            self.db,
            self.gateway,
            self.tracker.clock(),
            record,
            None,
        )
        .await?;

        Ok(match outcome {
            PushOutcome::Acknowledged => Ok(Resolution::Synced),
            PushOutcome::Removed => Ok(Resolution::Purged),
            PushOutcome::Superseded => Err(format!(
                "{} changed locally during resolution",
                record.entity_id
            )),
            PushOutcome::Conflict(message) | PushOutcome::Failed(message) => Err(message),
        })
    }
}
