//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::{Entry, SyncRecord};
use crate::sync::RemoteEntity;

/// A record in `Conflict` status paired with both sides' snapshots, for
/// presentation and manual resolution. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Sync metadata, status `Conflict`
    pub record: SyncRecord,
    /// Local snapshot; `None` when the local side is a pending deletion
    pub local: Option<Entry>,
    /// Remote snapshot, when one was captured by this process
    pub remote: Option<RemoteEntity>,
}

impl SyncConflict {
    /// Whether the local side of the conflict is a deletion.
    pub const fn is_local_deletion(&self) -> bool {
        self.record.deleted
    }

    /// Whether the remote side of the conflict is a deletion.
    pub fn is_remote_deletion(&self) -> bool {
        self.remote.as_ref().is_some_and(|remote| remote.deleted)
    }
}
