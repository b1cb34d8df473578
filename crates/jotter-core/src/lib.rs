//! jotter-core - Core library for Jotter
//!
//! This crate contains the journal models, the libSQL storage layer, and the
//! offline-first sync engine shared by every Jotter front end.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{DeviceId, EntityRef, Entry, EntryId, SyncConflict, SyncRecord, SyncStatus};
pub use services::JournalDatabase;
pub use state::SyncState;
