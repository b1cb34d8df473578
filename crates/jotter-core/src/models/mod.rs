//! Data models for Jotter

mod entry;
mod sync_conflict;
mod sync_record;

pub use entry::{extract_tags, Entry, EntryId, ENTRIES_TABLE};
pub use sync_conflict::SyncConflict;
pub use sync_record::{DeviceId, EntityRef, SyncRecord, SyncStatus};
