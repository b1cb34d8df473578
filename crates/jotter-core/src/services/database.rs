//! Shared journal database service used by the tracked write API, the sync
//! engine, and front ends.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::db::{
    Database, EntryRepository, LibSqlEntryRepository, LibSqlSyncMetaRepository,
    LibSqlSyncRecordStore, SyncMetaRepository, SyncRecordStore,
};
use crate::error::{Error, Result};
use crate::models::{DeviceId, EntityRef, Entry, EntryId, SyncRecord, SyncStatus, ENTRIES_TABLE};
use crate::sync::{ChangeKind, ChangeTracker};

/// Thread-safe handle to the local journal database.
///
/// The lock is held for one store operation (or one transaction) at a time,
/// never across a network call.
#[derive(Clone)]
pub struct JournalDatabase {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    conflicts: Arc<watch::Sender<Vec<SyncRecord>>>,
}

impl fmt::Debug for JournalDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalDatabase")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl JournalDatabase {
    /// Open (or create) the journal database at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened journal database at {}", db_path.display());
        Self::from_database(db, Some(db_path)).await
    }

    /// Open an in-memory database (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Self::from_database(db, None).await
    }

    async fn from_database(db: Database, db_path: Option<PathBuf>) -> Result<Self> {
        let conflicts = LibSqlSyncRecordStore::new(db.connection())
            .list_conflicts()
            .await?;
        let (sender, _) = watch::channel(conflicts);
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            conflicts: Arc::new(sender),
        })
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    // Entries (read-only)

    pub async fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection()).get(id).await
    }

    pub async fn list_entries(&self, limit: usize, offset: usize) -> Result<Vec<Entry>> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection())
            .list(limit, offset)
            .await
    }

    pub async fn list_entries_by_tag(
        &self,
        tag: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Entry>> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection())
            .list_by_tag(tag, limit, offset)
            .await
    }

    pub async fn list_entry_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection())
            .list_ids_by_prefix(prefix, limit)
            .await
    }

    pub async fn count_entries(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection()).count().await
    }

    // Sync records

    pub async fn record(&self, entity: &EntityRef) -> Result<Option<SyncRecord>> {
        let db = self.db.lock().await;
        LibSqlSyncRecordStore::new(db.connection()).get(entity).await
    }

    /// Records of `table` with an unsent local change (`Pending` or `Error`)
    pub async fn pending_records(&self, table: &str) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        LibSqlSyncRecordStore::new(db.connection())
            .list_pending(&EntityRef::table_prefix(table))
            .await
    }

    pub async fn records_with_status(
        &self,
        table: &str,
        status: SyncStatus,
    ) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        LibSqlSyncRecordStore::new(db.connection())
            .list_by_status(&EntityRef::table_prefix(table), status)
            .await
    }

    pub async fn conflict_records(&self) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        LibSqlSyncRecordStore::new(db.connection())
            .list_conflicts()
            .await
    }

    /// Number of entities waiting to be pushed (`Pending` plus `Error`)
    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let store = LibSqlSyncRecordStore::new(db.connection());
        Ok(store.count_by_status(SyncStatus::Pending).await?
            + store.count_by_status(SyncStatus::Error).await?)
    }

    pub async fn conflict_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlSyncRecordStore::new(db.connection())
            .count_by_status(SyncStatus::Conflict)
            .await
    }

    /// Live list of records in `Conflict`, refreshed after every write made
    /// through this service.
    pub fn watch_conflict_records(&self) -> watch::Receiver<Vec<SyncRecord>> {
        self.conflicts.subscribe()
    }

    // Local sync metadata

    pub async fn load_or_create_device_id(&self) -> Result<DeviceId> {
        let db = self.db.lock().await;
        LibSqlSyncMetaRepository::new(db.connection())
            .load_or_create_device_id()
            .await
    }

    pub async fn last_download_at(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        LibSqlSyncMetaRepository::new(db.connection())
            .last_download_at()
            .await
    }

    pub async fn set_last_download_at(&self, at: i64) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncMetaRepository::new(db.connection())
            .set_last_download_at(at)
            .await
    }

    // Tracked writes (entry mutation + sync record in one transaction)

    pub(crate) async fn insert_entry_tracked(
        &self,
        entry: &Entry,
        tracker: &ChangeTracker,
    ) -> Result<SyncRecord> {
        let db = self.db.lock().await;
        let entries = LibSqlEntryRepository::new(db.connection());
        let store = LibSqlSyncRecordStore::new(db.connection());
        let record = db
            .transaction(async {
                entries.insert(entry).await?;
                tracker
                    .record_change(&store, &entry.entity_ref(), ChangeKind::Upsert)
                    .await
            })
            .await?;
        self.publish_conflicts(&db).await?;
        Ok(record)
    }

    pub(crate) async fn update_entry_tracked(
        &self,
        id: &EntryId,
        content: &str,
        tracker: &ChangeTracker,
    ) -> Result<(Entry, SyncRecord)> {
        let db = self.db.lock().await;
        let entries = LibSqlEntryRepository::new(db.connection());
        let store = LibSqlSyncRecordStore::new(db.connection());
        let written = db
            .transaction(async {
                let mut entry = entries
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                entry.content = content.to_string();
                entry.updated_at = tracker.now();
                entries.update(&entry).await?;
                let record = tracker
                    .record_change(&store, &entry.entity_ref(), ChangeKind::Upsert)
                    .await?;
                Ok((entry, record))
            })
            .await?;
        self.publish_conflicts(&db).await?;
        Ok(written)
    }

    pub(crate) async fn delete_entry_tracked(
        &self,
        id: &EntryId,
        tracker: &ChangeTracker,
    ) -> Result<SyncRecord> {
        let db = self.db.lock().await;
        let entries = LibSqlEntryRepository::new(db.connection());
        let store = LibSqlSyncRecordStore::new(db.connection());
        let record = db
            .transaction(async {
                if !entries.delete_by_id(id).await? {
                    return Err(Error::NotFound(id.to_string()));
                }
                tracker
                    .record_change(&store, &id.entity_ref(), ChangeKind::Delete)
                    .await
            })
            .await?;
        self.publish_conflicts(&db).await?;
        Ok(record)
    }

    /// Write `content` as the new local state of `id`, re-creating the entry
    /// if the local side had deleted it. Like [`Self::requeue_resolved`], the
    /// write time becomes the reconciliation point.
    pub(crate) async fn write_merged_tracked(
        &self,
        id: &EntryId,
        content: &str,
        tracker: &ChangeTracker,
    ) -> Result<(Entry, SyncRecord)> {
        let db = self.db.lock().await;
        let entries = LibSqlEntryRepository::new(db.connection());
        let store = LibSqlSyncRecordStore::new(db.connection());
        let written = db
            .transaction(async {
                let now = tracker.now();
                let entry = match entries.get(id).await? {
                    Some(existing) => Entry {
                        content: content.to_string(),
                        updated_at: now,
                        ..existing
                    },
                    None => Entry {
                        id: *id,
                        content: content.to_string(),
                        created_at: now,
                        updated_at: now,
                    },
                };
                entries.upsert(&entry).await?;
                let mut record = tracker
                    .record_change(&store, &entry.entity_ref(), ChangeKind::Upsert)
                    .await?;
                record.last_sync_time = Some(now);
                store.upsert(&record).await?;
                Ok((entry, record))
            })
            .await?;
        self.publish_conflicts(&db).await?;
        Ok(written)
    }

    /// Re-queue a conflicted entity as `Pending` without touching its data,
    /// keeping the tombstone flag. The resolution time becomes the record's
    /// reconciliation point, so the next push is not refused as stale.
    pub(crate) async fn requeue_resolved(
        &self,
        entity: &EntityRef,
        tracker: &ChangeTracker,
    ) -> Result<SyncRecord> {
        let db = self.db.lock().await;
        let store = LibSqlSyncRecordStore::new(db.connection());
        let record = db
            .transaction(async {
                let current = store
                    .get(entity)
                    .await?
                    .ok_or_else(|| Error::NotFound(entity.to_string()))?;
                let kind = if current.deleted {
                    ChangeKind::Delete
                } else {
                    ChangeKind::Upsert
                };
                let mut record = tracker.record_change(&store, entity, kind).await?;
                record.last_sync_time = Some(record.last_modified);
                store.upsert(&record).await?;
                Ok(record)
            })
            .await?;
        self.publish_conflicts(&db).await?;
        Ok(record)
    }

    // Sync engine writes

    /// Store a remote snapshot locally together with its record.
    ///
    /// `expected` is the record state the caller decided on (`None` for an
    /// entity without a record). The write only happens if the stored record
    /// still equals it; `Ok(false)` means a local write got in between and
    /// nothing was changed.
    pub(crate) async fn apply_remote_snapshot(
        &self,
        entry: &Entry,
        expected: Option<&SyncRecord>,
        record: &SyncRecord,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let entries = LibSqlEntryRepository::new(db.connection());
        let store = LibSqlSyncRecordStore::new(db.connection());
        let applied = db
            .transaction(async {
                if store.get(&record.entity_id).await?.as_ref() != expected {
                    return Ok(false);
                }
                entries.upsert(entry).await?;
                store.upsert(record).await?;
                Ok(true)
            })
            .await?;
        if applied {
            self.publish_conflicts(&db).await?;
        }
        Ok(applied)
    }

    /// Remove an entity and its record entirely, if the record still equals
    /// `expected`. Returns whether anything was removed.
    pub(crate) async fn purge_entity(
        &self,
        entity: &EntityRef,
        expected: Option<&SyncRecord>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let entries = LibSqlEntryRepository::new(db.connection());
        let store = LibSqlSyncRecordStore::new(db.connection());
        let purged = db
            .transaction(async {
                if store.get(entity).await?.as_ref() != expected {
                    return Ok(false);
                }
                if entity.table() == ENTRIES_TABLE {
                    entries
                        .delete_by_id(&EntryId::from_entity_ref(entity)?)
                        .await?;
                }
                store.remove(entity).await?;
                Ok(true)
            })
            .await?;
        if purged {
            self.publish_conflicts(&db).await?;
        }
        Ok(purged)
    }

    pub(crate) async fn upsert_record(&self, record: &SyncRecord) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncRecordStore::new(db.connection())
            .upsert(record)
            .await?;
        self.publish_conflicts(&db).await
    }

    pub(crate) async fn mark_status(&self, entity: &EntityRef, status: SyncStatus) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncRecordStore::new(db.connection())
            .mark_status(entity, status)
            .await?;
        self.publish_conflicts(&db).await
    }

    /// Mark `entity` synced if it is still at `version`.
    pub(crate) async fn acknowledge(
        &self,
        entity: &EntityRef,
        version: u64,
        at: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let acknowledged = LibSqlSyncRecordStore::new(db.connection())
            .acknowledge(entity, version, at)
            .await?;
        self.publish_conflicts(&db).await?;
        Ok(acknowledged)
    }

    /// Drop the tombstone record of `entity` if it is still at `version`.
    pub(crate) async fn remove_acknowledged(&self, entity: &EntityRef, version: u64) -> Result<bool> {
        let db = self.db.lock().await;
        let removed = LibSqlSyncRecordStore::new(db.connection())
            .remove_acknowledged(entity, version)
            .await?;
        self.publish_conflicts(&db).await?;
        Ok(removed)
    }

    async fn publish_conflicts(&self, db: &Database) -> Result<()> {
        let conflicts = LibSqlSyncRecordStore::new(db.connection())
            .list_conflicts()
            .await?;
        self.conflicts.send_if_modified(|current| {
            if *current == conflicts {
                false
            } else {
                *current = conflicts;
                true
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Clock, ManualClock};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn tracker() -> ChangeTracker {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(500));
        ChangeTracker::new(DeviceId::from("phone"), clock)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("journal.db");

        let db = JournalDatabase::open_path(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(db.db_path(), Some(path.as_path()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicts_survive_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("journal.db");
        let tracker = tracker();

        let entity = {
            let db = JournalDatabase::open_path(&path).await.unwrap();
            let entry = Entry::new("draft", 1);
            db.insert_entry_tracked(&entry, &tracker).await.unwrap();
            db.mark_status(&entry.entity_ref(), SyncStatus::Conflict)
                .await
                .unwrap();
            entry.entity_ref()
        };

        let db = JournalDatabase::open_path(&path).await.unwrap();
        let conflicts = db.watch_conflict_records().borrow().clone();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity_id, entity);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_watch_follows_writes() {
        let db = JournalDatabase::open_in_memory().await.unwrap();
        let tracker = tracker();
        let mut conflicts = db.watch_conflict_records();
        assert!(conflicts.borrow().is_empty());

        let entry = Entry::new("watch me", 1);
        db.insert_entry_tracked(&entry, &tracker).await.unwrap();
        db.mark_status(&entry.entity_ref(), SyncStatus::Conflict)
            .await
            .unwrap();
        assert!(conflicts.has_changed().unwrap());
        assert_eq!(conflicts.borrow_and_update().len(), 1);
        assert_eq!(db.conflict_count().await.unwrap(), 1);

        let stale = db.record(&entry.entity_ref()).await.unwrap().unwrap();
        let mut newer = stale.clone();
        newer.version += 1;
        assert!(!db.purge_entity(&entry.entity_ref(), Some(&newer)).await.unwrap());
        assert_eq!(conflicts.borrow().len(), 1);

        assert!(db.purge_entity(&entry.entity_ref(), Some(&stale)).await.unwrap());
        assert!(conflicts.borrow_and_update().is_empty());
        assert!(db.get_entry(&entry.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_keeps_edit_landing_between_read_and_write() {
        use crate::sync::testing::ScriptedGateway;
        use crate::sync::{DownloadStage, Journal, UploadStage};
        use tokio_util::sync::CancellationToken;

        let clock = Arc::new(ManualClock::new(50_000));
        let db = JournalDatabase::open_in_memory().await.unwrap();
        let journal = Journal::new(
            db.clone(),
            ChangeTracker::new(DeviceId::from("phone"), clock.clone()),
        );
        let gateway = ScriptedGateway::new(clock.clone());
        let cancel = CancellationToken::new();

        let entry = journal.create_entry("original").await.unwrap();
        UploadStage::new(&db, &gateway, clock.as_ref(), journal.tracker().device_id())
            .run(&cancel)
            .await
            .unwrap();
        let synced = db.record(&entry.entity_ref()).await.unwrap().unwrap();
        assert_eq!(synced.status, SyncStatus::Synced);

        clock.advance(1_000);
        gateway.remote_edit(entry.id, "remote edit");

        // Queue the download's first read ahead of the edit, so the edit
        // commits between the download's reads and its write.
        let held = db.db.lock().await;
        let stage = DownloadStage::new(&db, &gateway, clock.as_ref());
        let (report, edited, ()) = tokio::join!(
            stage.run(Some(50_000), &cancel),
            journal.update_entry(&entry.id, "local edit"),
            async move {
                tokio::task::yield_now().await;
                drop(held);
            },
        );
        edited.unwrap();
        let report = report.unwrap();

        assert!(report.updated.is_empty());
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].record.status, SyncStatus::Conflict);

        let local = db.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(local.content, "local edit");
        let record = db.record(&entry.entity_ref()).await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Conflict);
        assert_eq!(record.version, synced.version + 1);
        assert_eq!(db.conflict_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_snapshot_refused_after_local_edit() {
        let db = JournalDatabase::open_in_memory().await.unwrap();
        let tracker = tracker();

        let entry = Entry::new("first", 1);
        db.insert_entry_tracked(&entry, &tracker).await.unwrap();
        let seen = db.record(&entry.entity_ref()).await.unwrap().unwrap();
        db.update_entry_tracked(&entry.id, "second", &tracker)
            .await
            .unwrap();

        let mut snapshot = entry.clone();
        snapshot.content = "from remote".to_string();
        let mut next = seen.clone();
        next.mark_applied_from_remote(900);
        let applied = db
            .apply_remote_snapshot(&snapshot, Some(&seen), &next)
            .await
            .unwrap();

        assert!(!applied);
        let local = db.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(local.content, "second");
        let record = db.record(&entry.entity_ref()).await.unwrap().unwrap();
        assert_eq!(record.version, seen.version + 1);
        assert_eq!(record.status, SyncStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_count_includes_failed_pushes() {
        let db = JournalDatabase::open_in_memory().await.unwrap();
        let tracker = tracker();

        let first = Entry::new("one", 1);
        let second = Entry::new("two", 2);
        db.insert_entry_tracked(&first, &tracker).await.unwrap();
        db.insert_entry_tracked(&second, &tracker).await.unwrap();
        db.mark_status(&second.entity_ref(), SyncStatus::Error)
            .await
            .unwrap();

        assert_eq!(db.pending_count().await.unwrap(), 2);
        assert_eq!(db.pending_records(ENTRIES_TABLE).await.unwrap().len(), 2);
        assert_eq!(
            db.records_with_status(ENTRIES_TABLE, SyncStatus::Error)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_merged_recreates_deleted_entry() {
        let db = JournalDatabase::open_in_memory().await.unwrap();
        let tracker = tracker();

        let entry = Entry::new("original", 1);
        db.insert_entry_tracked(&entry, &tracker).await.unwrap();
        db.delete_entry_tracked(&entry.id, &tracker).await.unwrap();

        let (merged, record) = db
            .write_merged_tracked(&entry.id, "merged", &tracker)
            .await
            .unwrap();
        assert_eq!(merged.content, "merged");
        assert!(!record.deleted);
        assert_eq!(record.version, 3);
        assert_eq!(db.get_entry(&entry.id).await.unwrap(), Some(merged));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requeue_resolved_keeps_tombstone() {
        let db = JournalDatabase::open_in_memory().await.unwrap();
        let tracker = tracker();

        let entry = Entry::new("gone soon", 1);
        db.insert_entry_tracked(&entry, &tracker).await.unwrap();
        db.delete_entry_tracked(&entry.id, &tracker).await.unwrap();
        db.mark_status(&entry.entity_ref(), SyncStatus::Conflict)
            .await
            .unwrap();

        let record = db
            .requeue_resolved(&entry.entity_ref(), &tracker)
            .await
            .unwrap();
        assert!(record.deleted);
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.version, 3);
        assert_eq!(record.last_sync_time, Some(500));
        assert_eq!(db.conflict_count().await.unwrap(), 0);
    }
}
