//! Upload stage: pushes unsent local changes to the remote.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use super::gateway::{GatewayError, RemoteGateway};
use super::TRACKED_TABLES;
use crate::error::{Error, Result};
use crate::models::{DeviceId, EntityRef, EntryId, SyncRecord, SyncStatus};
use crate::services::JournalDatabase;

/// Result of one upload pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Entities pushed and acknowledged (or purged, for deletions)
    pub succeeded: Vec<EntityRef>,
    /// Entities whose push failed; marked `Error` and retried next run
    pub failed: Vec<(EntityRef, String)>,
    /// Entities the remote refused because its copy changed; marked `Conflict`
    pub conflicts: Vec<EntityRef>,
    /// Stopped early; unprocessed entities are left untouched
    pub cancelled: bool,
}

impl UploadReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.conflicts.is_empty()
    }
}

/// What happened to a single push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Remote accepted the snapshot and the record is now `Synced`
    Acknowledged,
    /// Remote accepted the deletion and the tombstone record is gone
    Removed,
    /// Remote accepted, but a newer local change arrived meanwhile; still pending
    Superseded,
    /// Remote copy changed after the record's last sync
    Conflict(String),
    /// Transient or per-entity failure
    Failed(String),
}

/// Push one record. `base` is forwarded to the gateway as the precondition.
///
/// Only acknowledges successes; callers decide what a failure does to the
/// record's status. Fatal gateway errors are returned as `Err`.
pub(crate) async fn push_record<G: RemoteGateway>(
    db: &JournalDatabase,
    gateway: &G,
    clock: &dyn Clock,
    record: &SyncRecord,
    base: Option<i64>,
) -> Result<PushOutcome> {
    let entity = &record.entity_id;

    let pushed = if record.deleted {
        gateway.delete(entity, base).await
    } else {
        let id = match EntryId::from_entity_ref(entity) {
            Ok(id) => id,
            Err(error) => return Ok(PushOutcome::Failed(error.to_string())),
        };
        let Some(entry) = db.get_entry(&id).await? else {
            return Ok(PushOutcome::Failed(format!(
                "local snapshot of {entity} is missing"
            )));
        };
        gateway.create_or_update(&entry, base).await.map(|_| ())
    };

    match pushed {
        Ok(()) if record.deleted => {
            if db.remove_acknowledged(entity, record.version).await? {
                Ok(PushOutcome::Removed)
            } else {
                Ok(PushOutcome::Superseded)
            }
        }
        Ok(()) => {
            if db
                .acknowledge(entity, record.version, clock.now_millis())
                .await?
            {
                Ok(PushOutcome::Acknowledged)
            } else {
                Ok(PushOutcome::Superseded)
            }
        }
        Err(error) if error.is_fatal() => Err(Error::Gateway(error)),
        Err(GatewayError::Conflict(message)) => Ok(PushOutcome::Conflict(message)),
        Err(error) => Ok(PushOutcome::Failed(error.to_string())),
    }
}

/// Pushes every `Pending` (and previously failed) record of the tracked tables.
pub struct UploadStage<'a, G> {
    db: &'a JournalDatabase,
    gateway: &'a G,
    clock: &'a dyn Clock,
    device_id: &'a DeviceId,
}

impl<'a, G: RemoteGateway> UploadStage<'a, G> {
    pub fn new(
        db: &'a JournalDatabase,
        gateway: &'a G,
        clock: &'a dyn Clock,
        device_id: &'a DeviceId,
    ) -> Self {
        Self {
            db,
            gateway,
            clock,
            device_id,
        }
    }

    /// Run one upload pass.
    ///
    /// Entities are handled one at a time; a failure is recorded against that
    /// entity and the pass goes on. Authentication failures abort with `Err`.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<UploadReport> {
        let mut report = UploadReport::default();

        for table in TRACKED_TABLES {
            let pending = self.db.pending_records(table).await?;
            if !pending.is_empty() {
                tracing::info!(
                    "Uploading {} {table} changes from device {}",
                    pending.len(),
                    self.device_id
                );
            }

            for record in pending {
                if cancel.is_cancelled() {
                    tracing::info!("Upload cancelled");
                    report.cancelled = true;
                    return Ok(report);
                }
                self.push_one(&record, &mut report).await?;
            }
        }

        if !report.is_empty() {
            tracing::info!(
                "Upload finished: {} pushed, {} failed, {} conflicts",
                report.succeeded.len(),
                report.failed.len(),
                report.conflicts.len()
            );
        }
        Ok(report)
    }

    async fn push_one(&self, record: &SyncRecord, report: &mut UploadReport) -> Result<()> {
        let entity = record.entity_id.clone();
        let outcome = push_record(
            self.db,
            self.gateway,
            self.clock,
            record,
            record.last_sync_time,
        )
        .await?;

        match outcome {
            PushOutcome::Acknowledged | PushOutcome::Removed => report.succeeded.push(entity),
            PushOutcome::Superseded => {
                tracing::debug!("{entity} changed during upload; stays pending");
                report.succeeded.push(entity);
            }
            PushOutcome::Conflict(message) => {
                tracing::info!("Remote copy of {entity} changed since last sync: {message}");
                self.db.mark_status(&entity, SyncStatus::Conflict).await?;
                report.conflicts.push(entity);
            }
            PushOutcome::Failed(message) => {
                tracing::warn!("Failed to upload {entity}: {message}");
                self.db.mark_status(&entity, SyncStatus::Error).await?;
                report.failed.push((entity, message));
            }
        }
        Ok(())
    }
}
