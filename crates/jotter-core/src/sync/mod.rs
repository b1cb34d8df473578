//! Offline-first sync engine.
//!
//! Local writes go through [`Journal`], which records every change in the
//! sync record store. A [`SyncOrchestrator`] cycle then pushes unsent changes
//! ([`UploadStage`]) and pulls remote ones ([`DownloadStage`]); collisions are
//! kept as conflicts until settled through [`ConflictResolver`].

mod clock;
mod download;
mod gateway;
mod http;
mod orchestrator;
mod resolver;
mod tracker;
mod upload;

#[cfg(test)]
pub(crate) mod testing;

use crate::models::ENTRIES_TABLE;

pub use clock::{Clock, ManualClock, SystemClock};
pub use download::{DownloadReport, DownloadStage};
pub use gateway::{GatewayError, GatewayResult, RemoteEntity, RemoteGateway, RemoteId};
pub use http::{HttpGateway, DEFAULT_TIMEOUT};
pub use orchestrator::{RunOutcome, SyncOrchestrator, SyncSummary};
pub use resolver::{ConflictResolver, ConflictStrategy, Resolution};
pub use tracker::{ChangeKind, ChangeTracker, Journal};
pub use upload::{UploadReport, UploadStage};

/// Tables whose rows are tracked and synced
pub const TRACKED_TABLES: &[&str] = &[ENTRIES_TABLE];
