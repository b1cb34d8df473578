//! Download stage: applies remote changes to the local copy.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use super::gateway::{RemoteEntity, RemoteGateway};
use crate::error::{Error, Result};
use crate::models::{EntityRef, SyncConflict, SyncRecord, SyncStatus};
use crate::services::JournalDatabase;

/// Result of one download pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    /// Entities that did not exist locally
    pub inserted: Vec<EntityRef>,
    /// Local copies overwritten with the remote snapshot
    pub updated: Vec<EntityRef>,
    /// Local copies removed because the remote deleted them
    pub deleted: Vec<EntityRef>,
    /// Remote changes colliding with an unsent local change
    pub conflicts: Vec<SyncConflict>,
    /// Remote changes already reflected locally
    pub skipped: Vec<EntityRef>,
    pub cancelled: bool,
}

impl DownloadReport {
    /// Number of local changes the pass applied
    pub fn applied(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// Pulls remote changes since a watermark and merges them into the local copy.
///
/// Divergence is decided from the local record status only: an entity with
/// an unsent local change is never overwritten, whatever the timestamps say.
pub struct DownloadStage<'a, G> {
    db: &'a JournalDatabase,
    gateway: &'a G,
    clock: &'a dyn Clock,
}

impl<'a, G: RemoteGateway> DownloadStage<'a, G> {
    pub fn new(db: &'a JournalDatabase, gateway: &'a G, clock: &'a dyn Clock) -> Self {
        Self { db, gateway, clock }
    }

    /// Fetch and apply every remote change after `since` (all when `None`).
    ///
    /// A failed fetch aborts the pass; per-entity storage failures propagate.
    pub async fn run(&self, since: Option<i64>, cancel: &CancellationToken) -> Result<DownloadReport> {
        let changes = self
            .gateway
            .fetch_changes(since)
            .await
            .map_err(Error::Gateway)?;
        tracing::debug!("Downloaded {} remote changes since {since:?}", changes.len());

        let mut report = DownloadReport::default();
        for remote in changes {
            if cancel.is_cancelled() {
                tracing::info!("Download cancelled");
                report.cancelled = true;
                break;
            }
            self.apply(remote, &mut report).await?;
        }

        if report.applied() > 0 || !report.conflicts.is_empty() {
            tracing::info!(
                "Download finished: {} inserted, {} updated, {} deleted, {} conflicts",
                report.inserted.len(),
                report.updated.len(),
                report.deleted.len(),
                report.conflicts.len()
            );
        }
        Ok(report)
    }

    async fn apply(&self, remote: RemoteEntity, report: &mut DownloadReport) -> Result<()> {
        let entity = remote.entity_ref();

        // Local writes may land between the reads and the write below; the
        // write is guarded by the record state read here and re-decided if
        // that state moved on.
        loop {
            let record = self.db.record(&entity).await?;
            let local = self.db.get_entry(&remote.id).await?;

            if let Some(mut record) = record.clone().filter(|record| {
                record.status.has_unsent_change() || record.status == SyncStatus::Conflict
            }) {
                if record.status != SyncStatus::Conflict {
                    tracing::info!("Conflict on {entity}: changed locally and remotely");
                    self.db.mark_status(&entity, SyncStatus::Conflict).await?;
                    record.status = SyncStatus::Conflict;
                }
                report.conflicts.push(SyncConflict {
                    record,
                    local,
                    remote: Some(remote),
                });
                return Ok(());
            }

            if remote.deleted {
                if local.is_none() && record.is_none() {
                    report.skipped.push(entity);
                    return Ok(());
                }
                if self.db.purge_entity(&entity, record.as_ref()).await? {
                    tracing::debug!("Removed {entity} deleted remotely");
                    report.deleted.push(entity);
                    return Ok(());
                }
            } else {
                let unchanged = matches!(
                    (&local, &record),
                    (Some(local), Some(record))
                        if record.status == SyncStatus::Synced && remote.matches(local)
                );
                if unchanged {
                    report.skipped.push(entity);
                    return Ok(());
                }

                let now = self.clock.now_millis();
                let next = match &record {
                    Some(record) => {
                        let mut next = record.clone();
                        next.mark_applied_from_remote(now);
                        next
                    }
                    None => SyncRecord::from_remote(entity.clone(), now),
                };
                if self
                    .db
                    .apply_remote_snapshot(&remote.to_entry(), record.as_ref(), &next)
                    .await?
                {
                    if local.is_some() {
                        report.updated.push(entity);
                    } else {
                        report.inserted.push(entity);
                    }
                    return Ok(());
                }
            }

            tracing::debug!("{entity} changed locally while applying a remote change; re-checking");
        }
    }
}
