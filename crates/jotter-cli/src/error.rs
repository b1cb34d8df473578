use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] jotter_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No entry content provided")]
    EmptyContent,
    #[error("Edited entry content cannot be empty")]
    EmptyEditedContent,
    #[error("Entry ID cannot be empty")]
    EmptyEntryId,
    #[error("Entry not found for id/prefix: {0}")]
    EntryNotFound(String),
    #[error("No open conflict for id/prefix: {0}")]
    ConflictNotFound(String),
    #[error("{0}")]
    AmbiguousEntryId(String),
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error("Choose exactly one of --local, --remote or --manual")]
    InvalidStrategy,
    #[error("Automatic sync is disabled (JOTTER_SYNC_INTERVAL_SECS=0); run `jotter sync` manually")]
    AutoSyncDisabled,
    #[error("Sync is not configured. Set JOTTER_API_URL and JOTTER_API_TOKEN to enable `jotter sync`.")]
    SyncNotConfigured,
}
