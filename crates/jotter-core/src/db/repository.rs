//! Journal entry repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use crate::error::{Error, Result};
use crate::models::{Entry, EntryId};
use libsql::{params, Connection, Row};

/// Read access to journal entries (async)
///
/// Mutations are deliberately absent: they live on
/// [`LibSqlEntryRepository`] as crate-private methods and are reachable from
/// outside the crate only through [`crate::sync::Journal`].
#[allow(async_fn_in_trait)]
pub trait EntryRepository {
    /// Get an entry by ID
    async fn get(&self, id: &EntryId) -> Result<Option<Entry>>;

    /// List entries, most recently updated first
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Entry>>;

    /// List entries carrying the given #tag, most recently updated first
    async fn list_by_tag(&self, tag: &str, limit: usize, offset: usize) -> Result<Vec<Entry>>;

    /// List entry ids starting with `prefix`
    async fn list_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Count all entries
    async fn count(&self) -> Result<usize>;
}

/// libSQL implementation of `EntryRepository`
pub struct LibSqlEntryRepository<'a> {
    conn: &'a Connection,
}

const ENTRY_COLUMNS: &str = "id, content, created_at, updated_at";

impl<'a> LibSqlEntryRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an entry from a database row
    fn parse_entry(row: &Row) -> Result<Entry> {
        let id: String = row.get(0)?;
        Ok(Entry {
            id: id
                .parse()
                .map_err(|_| Error::Database(format!("invalid entry id '{id}'")))?,
            content: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }

    async fn collect(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Entry>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }

    /// Insert a new entry row
    pub(crate) async fn insert(&self, entry: &Entry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO entries (id, content, created_at, updated_at) VALUES (?, ?, ?, ?)",
                params![
                    entry.id.as_str(),
                    entry.content.as_str(),
                    entry.created_at,
                    entry.updated_at
                ],
            )
            .await?;
        Ok(())
    }

    /// Overwrite an existing entry row
    pub(crate) async fn update(&self, entry: &Entry) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE entries SET content = ?, updated_at = ? WHERE id = ?",
                params![entry.content.as_str(), entry.updated_at, entry.id.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(entry.id.to_string()));
        }
        Ok(())
    }

    /// Insert or overwrite an entry row with a snapshot (used when applying
    /// remote data, so `created_at` is taken from the snapshot too)
    pub(crate) async fn upsert(&self, entry: &Entry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO entries (id, content, created_at, updated_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    entry.id.as_str(),
                    entry.content.as_str(),
                    entry.created_at,
                    entry.updated_at
                ],
            )
            .await?;
        Ok(())
    }

    /// Hard-delete an entry row. Returns whether a row was removed.
    pub(crate) async fn delete_by_id(&self, id: &EntryId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM entries WHERE id = ?", [id.as_str()])
            .await?;
        Ok(rows > 0)
    }
}

impl EntryRepository for LibSqlEntryRepository<'_> {
    async fn get(&self, id: &EntryId) -> Result<Option<Entry>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?"),
                [id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entry(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Entry>> {
        self.collect(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 ORDER BY updated_at DESC
                 LIMIT ? OFFSET ?"
            ),
            params![limit as i64, offset as i64],
        )
        .await
    }

    async fn list_by_tag(&self, tag: &str, limit: usize, offset: usize) -> Result<Vec<Entry>> {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        if tag.is_empty() {
            return Ok(Vec::new());
        }

        // LIKE narrows the scan; exact tag matching happens on the parsed content.
        let candidates = self
            .collect(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries
                     WHERE content LIKE ?
                     ORDER BY updated_at DESC"
                ),
                [format!("%#{tag}%")],
            )
            .await?;

        Ok(candidates
            .into_iter()
            .filter(|entry| entry.tags().contains(&tag))
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn list_ids_by_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM entries
                 WHERE substr(id, 1, length(?)) = ?
                 ORDER BY updated_at DESC
                 LIMIT ?",
                params![prefix, prefix, limit as i64],
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    async fn count(&self) -> Result<usize> {
        let mut rows = self.conn.query("SELECT COUNT(*) FROM entries", ()).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        usize::try_from(count).map_err(|_| Error::Database(format!("invalid count {count}")))
    }
}
