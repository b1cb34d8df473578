//! Shared sync state types.

use serde::{Deserialize, Serialize};

/// Lifecycle of the sync orchestrator, published to front ends.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Success,
    /// The last cycle was aborted; committed progress is kept.
    Error(String),
}

impl SyncState {
    pub const fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error(_) => "error",
        }
    }
}
