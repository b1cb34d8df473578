//! Local sync metadata repository (device id, download watermark)

use crate::error::{Error, Result};
use crate::models::DeviceId;
use libsql::Connection;

const DEVICE_ID_KEY: &str = "device_id";
const LAST_DOWNLOAD_KEY: &str = "last_download_at";

/// Trait for local-only sync metadata (async)
#[allow(async_fn_in_trait)]
pub trait SyncMetaRepository {
    /// Load the device id, generating and persisting one on first use
    async fn load_or_create_device_id(&self) -> Result<DeviceId>;

    /// Timestamp the last completed download started fetching from
    async fn last_download_at(&self) -> Result<Option<i64>>;

    /// Persist the download watermark
    async fn set_last_download_at(&self, at: i64) -> Result<()>;
}

/// libSQL implementation of `SyncMetaRepository`
pub struct LibSqlSyncMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_meta WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }
}

impl SyncMetaRepository for LibSqlSyncMetaRepository<'_> {
    async fn load_or_create_device_id(&self) -> Result<DeviceId> {
        if let Some(value) = self.get_value(DEVICE_ID_KEY).await? {
            if !value.trim().is_empty() {
                return Ok(DeviceId::from(value));
            }
        }

        let device_id = DeviceId::generate();
        self.set_value(DEVICE_ID_KEY, device_id.as_str()).await?;
        tracing::info!("Generated device id {device_id}");
        Ok(device_id)
    }

    async fn last_download_at(&self) -> Result<Option<i64>> {
        self.get_value(LAST_DOWNLOAD_KEY)
            .await?
            .map(|value| {
                value.parse().map_err(|_| {
                    Error::Database(format!("invalid {LAST_DOWNLOAD_KEY} value '{value}'"))
                })
            })
            .transpose()
    }

    async fn set_last_download_at(&self, at: i64) -> Result<()> {
        self.set_value(LAST_DOWNLOAD_KEY, &at.to_string()).await
    }
}
