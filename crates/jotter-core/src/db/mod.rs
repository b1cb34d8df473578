//! Database layer for Jotter

mod connection;
mod meta_repository;
mod migrations;
mod repository;
mod sync_record_repository;

pub use connection::Database;
pub use meta_repository::{LibSqlSyncMetaRepository, SyncMetaRepository};
pub use repository::{EntryRepository, LibSqlEntryRepository};
pub use sync_record_repository::{LibSqlSyncRecordStore, SyncRecordStore};
