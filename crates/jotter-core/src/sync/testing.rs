//! In-process remote used by the sync engine tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::clock::{Clock, ManualClock};
use super::gateway::{entry_id_of, GatewayError, GatewayResult, RemoteEntity, RemoteGateway, RemoteId};
use crate::models::{EntityRef, Entry, EntryId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Put(EntryId),
    Delete(EntryId),
    FetchChanges(Option<i64>),
    Fetch(EntryId),
}

struct Stored {
    entity: RemoteEntity,
    /// Server-side modification time, drives `fetch_changes` and preconditions
    modified_at: i64,
}

#[derive(Default)]
struct Script {
    remote: HashMap<EntryId, Stored>,
    calls: Vec<Call>,
    failing: HashMap<EntryId, GatewayError>,
    fail_all: Option<GatewayError>,
    fetch_error: Option<GatewayError>,
    fetch_gate: Option<Arc<Notify>>,
    entity_gate: Option<Arc<Notify>>,
}

/// Remote journal kept in memory, stamped with a shared manual clock.
#[derive(Clone)]
pub(crate) struct ScriptedGateway {
    script: Arc<Mutex<Script>>,
    clock: Arc<ManualClock>,
}

impl ScriptedGateway {
    pub(crate) fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            clock,
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, entity: RemoteEntity) {
        let modified_at = self.clock.now_millis();
        self.script().remote.insert(
            entity.id,
            Stored {
                entity,
                modified_at,
            },
        );
    }

    /// Create an entry that only exists remotely.
    pub(crate) fn seed(&self, content: &str, created_at: i64) -> RemoteEntity {
        let entity = RemoteEntity {
            id: EntryId::new(),
            content: content.to_string(),
            created_at,
            updated_at: created_at,
            deleted: false,
        };
        self.store(entity.clone());
        entity
    }

    /// Store `entry` as another device would have pushed it.
    pub(crate) fn seed_entry(&self, entry: &Entry) {
        self.store(RemoteEntity::from_entry(entry));
    }

    /// Edit an existing remote entry now.
    pub(crate) fn remote_edit(&self, id: EntryId, content: &str) {
        let mut entity = self.remote(&id).expect("remote entry exists");
        entity.content = content.to_string();
        entity.updated_at = self.clock.now_millis();
        entity.deleted = false;
        self.store(entity);
    }

    /// Delete an entry remotely now, leaving a tombstone in the change feed.
    pub(crate) fn remote_delete(&self, id: EntryId) {
        let now = self.clock.now_millis();
        let created_at = self.remote(&id).map_or(now, |entity| entity.created_at);
        self.store(RemoteEntity::tombstone(id, created_at, now));
    }

    pub(crate) fn remote(&self, id: &EntryId) -> Option<RemoteEntity> {
        self.script()
            .remote
            .get(id)
            .map(|stored| stored.entity.clone())
    }

    pub(crate) fn fail_entity(&self, id: EntryId, error: GatewayError) {
        self.script().failing.insert(id, error);
    }

    /// Make every call fail with `error`.
    pub(crate) fn fail_all(&self, error: GatewayError) {
        self.script().fail_all = Some(error);
    }

    pub(crate) fn fail_fetch(&self, error: GatewayError) {
        self.script().fetch_error = Some(error);
    }

    pub(crate) fn clear_failures(&self) {
        let mut script = self.script();
        script.failing.clear();
        script.fail_all = None;
        script.fetch_error = None;
    }

    /// Hold every `fetch_changes` call until `gate` is notified.
    pub(crate) fn gate_fetches(&self, gate: Arc<Notify>) {
        self.script().fetch_gate = Some(gate);
    }

    /// Hold every single-entity `fetch` until `gate` is notified. The call
    /// is logged before it blocks.
    pub(crate) fn gate_entity_fetches(&self, gate: Arc<Notify>) {
        self.script().entity_gate = Some(gate);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.script().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.script().calls.clear();
    }

    fn check_failure(script: &Script, id: Option<&EntryId>) -> GatewayResult<()> {
        if let Some(error) = &script.fail_all {
            return Err(error.clone());
        }
        if let Some(error) = id.and_then(|id| script.failing.get(id)) {
            return Err(error.clone());
        }
        Ok(())
    }

    fn check_base(script: &Script, id: &EntryId, base: Option<i64>) -> GatewayResult<()> {
        match (script.remote.get(id), base) {
            (Some(stored), Some(base)) if stored.modified_at > base => {
                Err(GatewayError::Conflict(format!("entries:{id}")))
            }
            _ => Ok(()),
        }
    }
}

impl RemoteGateway for ScriptedGateway {
    async fn create_or_update(&self, entry: &Entry, base: Option<i64>) -> GatewayResult<RemoteId> {
        {
            let mut script = self.script();
            script.calls.push(Call::Put(entry.id));
            Self::check_failure(&script, Some(&entry.id))?;
            Self::check_base(&script, &entry.id, base)?;
        }
        self.store(RemoteEntity::from_entry(entry));
        Ok(RemoteId(entry.id.to_string()))
    }

    async fn delete(&self, entity: &EntityRef, base: Option<i64>) -> GatewayResult<()> {
        let id = entry_id_of(entity)?;
        let created_at = {
            let mut script = self.script();
            script.calls.push(Call::Delete(id));
            Self::check_failure(&script, Some(&id))?;
            Self::check_base(&script, &id, base)?;
            match script.remote.get(&id) {
                Some(stored) if !stored.entity.deleted => stored.entity.created_at,
                _ => return Ok(()),
            }
        };
        self.store(RemoteEntity::tombstone(id, created_at, self.clock.now_millis()));
        Ok(())
    }

    async fn fetch_changes(&self, since: Option<i64>) -> GatewayResult<Vec<RemoteEntity>> {
        let gate = self.script().fetch_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut script = self.script();
        script.calls.push(Call::FetchChanges(since));
        Self::check_failure(&script, None)?;
        if let Some(error) = &script.fetch_error {
            return Err(error.clone());
        }

        let mut changes: Vec<_> = script
            .remote
            .values()
            .filter(|stored| since.is_none_or(|since| stored.modified_at > since))
            .map(|stored| (stored.modified_at, stored.entity.clone()))
            .collect();
        changes.sort_by_key(|(modified_at, entity)| (*modified_at, entity.id.to_string()));
        Ok(changes.into_iter().map(|(_, entity)| entity).collect())
    }

    async fn fetch(&self, entity: &EntityRef) -> GatewayResult<Option<RemoteEntity>> {
        let id = entry_id_of(entity)?;
        let gate = {
            let mut script = self.script();
            script.calls.push(Call::Fetch(id));
            script.entity_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let script = self.script();
        Self::check_failure(&script, Some(&id))?;
        Ok(script.remote.get(&id).map(|stored| stored.entity.clone()))
    }
}
