//! Change tracking and the tracked write API for journal entries.

use std::fmt;
use std::sync::Arc;

use super::clock::{Clock, SystemClock};
use crate::db::SyncRecordStore;
use crate::error::{Error, Result};
use crate::models::{DeviceId, EntityRef, Entry, EntryId, SyncRecord};
use crate::services::JournalDatabase;

/// What happened to an entity locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// Turns local mutations into `Pending` sync records.
#[derive(Clone)]
pub struct ChangeTracker {
    device_id: DeviceId,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl ChangeTracker {
    pub fn new(device_id: DeviceId, clock: Arc<dyn Clock>) -> Self {
        Self { device_id, clock }
    }

    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Record a local change to `entity` in `store`.
    ///
    /// Loads or creates the record, stamps it with this device and the
    /// current time, bumps the version and marks it `Pending`. Must run in
    /// the same transaction as the entity mutation itself.
    pub async fn record_change(
        &self,
        store: &impl SyncRecordStore,
        entity: &EntityRef,
        kind: ChangeKind,
    ) -> Result<SyncRecord> {
        let now = self.now();
        let mut record = store
            .get(entity)
            .await?
            .unwrap_or_else(|| SyncRecord::untracked(entity.clone(), self.device_id.clone(), now));
        record.mark_pending(&self.device_id, now, kind == ChangeKind::Delete);
        store.upsert(&record).await?;

        tracing::debug!(
            "Tracked {kind:?} of {entity} (version {})",
            record.version
        );
        Ok(record)
    }
}

/// The only public way to create, edit, or delete journal entries.
///
/// Every write commits the entry mutation and its sync record together.
#[derive(Clone, Debug)]
pub struct Journal {
    db: JournalDatabase,
    tracker: ChangeTracker,
}

impl Journal {
    pub const fn new(db: JournalDatabase, tracker: ChangeTracker) -> Self {
        Self { db, tracker }
    }

    /// Open a journal on `db` with this install's device id and the wall clock.
    pub async fn open(db: JournalDatabase) -> Result<Self> {
        let device_id = db.load_or_create_device_id().await?;
        Ok(Self::new(db, ChangeTracker::new(device_id, Arc::new(SystemClock))))
    }

    /// Read access to entries and sync metadata
    pub const fn database(&self) -> &JournalDatabase {
        &self.db
    }

    pub const fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub async fn create_entry(&self, content: &str) -> Result<Entry> {
        validate_content(content)?;
        let entry = Entry::new(content, self.tracker.now());
        self.db.insert_entry_tracked(&entry, &self.tracker).await?;
        tracing::debug!("Created entry {}", entry.id);
        Ok(entry)
    }

    pub async fn update_entry(&self, id: &EntryId, content: &str) -> Result<Entry> {
        validate_content(content)?;
        let (entry, _) = self
            .db
            .update_entry_tracked(id, content, &self.tracker)
            .await?;
        tracing::debug!("Updated entry {id}");
        Ok(entry)
    }

    /// Delete an entry; the tombstone stays in its sync record until the
    /// remote acknowledges the deletion.
    pub async fn delete_entry(&self, id: &EntryId) -> Result<()> {
        self.db.delete_entry_tracked(id, &self.tracker).await?;
        tracing::debug!("Deleted entry {id}");
        Ok(())
    }
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::InvalidInput(
            "Entry content cannot be empty".to_string(),
        ));
    }
    Ok(())
}
