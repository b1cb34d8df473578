//! Sync record store implementation

use crate::error::{Error, Result};
use crate::models::{EntityRef, SyncRecord, SyncStatus};
use libsql::{params, Connection, Row, Value};

/// Persistent store of per-entity sync metadata (async)
///
/// Every key is an [`EntityRef`]; `prefix` arguments are `"<table>:"` strings
/// built with [`EntityRef::table_prefix`].
#[allow(async_fn_in_trait)]
pub trait SyncRecordStore {
    /// Get the record for an entity
    async fn get(&self, entity: &EntityRef) -> Result<Option<SyncRecord>>;

    /// Insert or replace the record for `record.entity_id`
    async fn upsert(&self, record: &SyncRecord) -> Result<()>;

    /// Records with an unsent local change (`Pending` or `Error`), oldest first
    async fn list_pending(&self, prefix: &str) -> Result<Vec<SyncRecord>>;

    /// Records in the given status, oldest first
    async fn list_by_status(&self, prefix: &str, status: SyncStatus) -> Result<Vec<SyncRecord>>;

    /// All records in `Conflict` status, across tables
    async fn list_conflicts(&self) -> Result<Vec<SyncRecord>>;

    /// Set the status of a record without touching anything else
    async fn mark_status(&self, entity: &EntityRef, status: SyncStatus) -> Result<()>;

    /// Mark a record `Synced` as of `at`
    async fn mark_synced(&self, entity: &EntityRef, at: i64) -> Result<()>;

    /// [`Self::mark_synced`], but only if the record is still at `version`.
    ///
    /// Returns `false` when a newer local change superseded the pushed one.
    /// Callers hold the connection for the read and the write.
    async fn acknowledge(&self, entity: &EntityRef, version: u64, at: i64) -> Result<bool> {
        match self.get(entity).await? {
            Some(record) if record.version == version => {
                self.mark_synced(entity, at).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, entity: &EntityRef) -> Result<bool>;

    /// Delete a record only if it is still at `version`.
    async fn remove_acknowledged(&self, entity: &EntityRef, version: u64) -> Result<bool>;

    /// Count records in the given status
    async fn count_by_status(&self, status: SyncStatus) -> Result<usize>;
}

/// libSQL implementation of `SyncRecordStore`
pub struct LibSqlSyncRecordStore<'a> {
    conn: &'a Connection,
}

const RECORD_COLUMNS: &str =
    "entity_id, last_modified, device_id, status, version, deleted, last_sync_time";

fn version_param(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::Database(format!("version {version} out of range")))
}

impl<'a> LibSqlSyncRecordStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &Row) -> Result<SyncRecord> {
        let entity_id: String = row.get(0)?;
        let status: String = row.get(3)?;
        let version: i64 = row.get(4)?;
        let last_sync_time = match row.get_value(6)? {
            Value::Integer(at) => Some(at),
            Value::Null => None,
            other => {
                return Err(Error::Database(format!(
                    "unexpected last_sync_time value {other:?}"
                )))
            }
        };

        Ok(SyncRecord {
            entity_id: entity_id.parse()?,
            last_modified: row.get(1)?,
            device_id: row.get::<String>(2)?.into(),
            status: status.parse()?,
            version: u64::try_from(version)
                .map_err(|_| Error::Database(format!("negative version {version}")))?,
            deleted: row.get::<i32>(5)? != 0,
            last_sync_time,
        })
    }

    async fn collect(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<SyncRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }
}

impl SyncRecordStore for LibSqlSyncRecordStore<'_> {
    async fn get(&self, entity: &EntityRef) -> Result<Option<SyncRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM sync_records WHERE entity_id = ?"),
                [entity.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &SyncRecord) -> Result<()> {
        let last_sync_time = record.last_sync_time.map_or(Value::Null, Value::Integer);
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_records
                    (entity_id, last_modified, device_id, status, version, deleted, last_sync_time)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.entity_id.to_string(),
                    record.last_modified,
                    record.device_id.as_str(),
                    record.status.as_str(),
                    version_param(record.version)?,
                    i32::from(record.deleted),
                    last_sync_time
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_pending(&self, prefix: &str) -> Result<Vec<SyncRecord>> {
        self.collect(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM sync_records
                 WHERE substr(entity_id, 1, length(?)) = ?
                   AND status IN ('pending', 'error')
                 ORDER BY last_modified ASC, entity_id ASC"
            ),
            [prefix, prefix],
        )
        .await
    }

    async fn list_by_status(&self, prefix: &str, status: SyncStatus) -> Result<Vec<SyncRecord>> {
        self.collect(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM sync_records
                 WHERE substr(entity_id, 1, length(?)) = ? AND status = ?
                 ORDER BY last_modified ASC, entity_id ASC"
            ),
            [prefix, prefix, status.as_str()],
        )
        .await
    }

    async fn list_conflicts(&self) -> Result<Vec<SyncRecord>> {
        self.collect(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM sync_records
                 WHERE status = 'conflict'
                 ORDER BY last_modified ASC, entity_id ASC"
            ),
            (),
        )
        .await
    }

    async fn mark_status(&self, entity: &EntityRef, status: SyncStatus) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_records SET status = ? WHERE entity_id = ?",
                [status.as_str().to_string(), entity.to_string()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(entity.to_string()));
        }
        Ok(())
    }

    async fn mark_synced(&self, entity: &EntityRef, at: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_records SET status = 'synced', last_sync_time = ? WHERE entity_id = ?",
                params![at, entity.to_string()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(entity.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, entity: &EntityRef) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM sync_records WHERE entity_id = ?",
                [entity.to_string()],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn remove_acknowledged(&self, entity: &EntityRef, version: u64) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM sync_records WHERE entity_id = ? AND version = ?",
                params![entity.to_string(), version_param(version)?],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn count_by_status(&self, status: SyncStatus) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_records WHERE status = ?",
                [status.as_str()],
            )
            .await?;

        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        usize::try_from(count).map_err(|_| Error::Database(format!("invalid count {count}")))
    }
}
