//! Sync cycle driver: single-flight runs, observable state, conflict list.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::clock::Clock;
use super::download::{DownloadReport, DownloadStage};
use super::gateway::{RemoteEntity, RemoteGateway};
use super::resolver::{ConflictResolver, ConflictStrategy, Resolution};
use super::tracker::ChangeTracker;
use super::upload::{UploadReport, UploadStage};
use crate::error::{Error, Result};
use crate::models::{DeviceId, EntityRef, Entry, EntryId, SyncConflict, SyncRecord};
use crate::services::JournalDatabase;
use crate::state::SyncState;

/// What one completed cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub upload: UploadReport,
    pub download: DownloadReport,
}

impl SyncSummary {
    /// Whether either stage stopped early
    pub const fn cancelled(&self) -> bool {
        self.upload.cancelled || self.download.cancelled
    }

    /// Distinct entities that ended the cycle in conflict
    pub fn conflict_count(&self) -> usize {
        self.upload
            .conflicts
            .iter()
            .chain(self.download.conflicts.iter().map(|conflict| &conflict.record.entity_id))
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// How a call to [`SyncOrchestrator::run`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(SyncSummary),
    /// Another cycle was in progress; nothing was done
    AlreadyRunning,
    /// Stopped by [`SyncOrchestrator::cancel`]; unprocessed entities stay as they were
    Cancelled,
    /// The orchestrator was shut down
    ShutDown,
}

/// Drives upload-then-download cycles against one remote.
///
/// At most one cycle (or conflict resolution) runs at a time.
pub struct SyncOrchestrator<G> {
    db: JournalDatabase,
    gateway: G,
    clock: Arc<dyn Clock>,
    tracker: ChangeTracker,
    run_lock: Mutex<()>,
    state: watch::Sender<SyncState>,
    conflicts: Arc<ConflictFeed>,
    current_cycle: StdMutex<Option<CancellationToken>>,
    lifetime: CancellationToken,
}

impl<G: RemoteGateway> SyncOrchestrator<G> {
    /// Must be called from within a Tokio runtime: the conflicts observable
    /// is kept current by a task that lives until [`Self::shutdown`] or drop.
    pub fn new(db: JournalDatabase, gateway: G, clock: Arc<dyn Clock>, device_id: DeviceId) -> Self {
        let tracker = ChangeTracker::new(device_id, clock.clone());
        let lifetime = CancellationToken::new();
        let conflicts = Arc::new(ConflictFeed::new(db.clone()));
        tokio::spawn(conflicts.clone().follow_store(lifetime.clone()));

        Self {
            db,
            gateway,
            clock,
            tracker,
            run_lock: Mutex::new(()),
            state: watch::channel(SyncState::Idle).0,
            conflicts,
            current_cycle: StdMutex::new(None),
            lifetime,
        }
    }

    pub const fn database(&self) -> &JournalDatabase {
        &self.db
    }

    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn device_id(&self) -> &DeviceId {
        self.tracker.device_id()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Live list of open conflicts, seeded from the store and republished
    /// whenever a conflict is raised or cleared by any writer.
    pub fn subscribe_conflicts(&self) -> watch::Receiver<Vec<SyncConflict>> {
        self.conflicts.published.subscribe()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.db.pending_count().await
    }

    pub async fn conflict_count(&self) -> Result<usize> {
        self.db.conflict_count().await
    }

    /// Run one sync cycle: upload, then download.
    ///
    /// Returns immediately with [`RunOutcome::AlreadyRunning`] if a cycle is
    /// in progress. Fatal failures are returned as `Err` and published as
    /// [`SyncState::Error`]; progress committed before the failure is kept.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self.lifetime.is_cancelled() {
            return Ok(RunOutcome::ShutDown);
        }
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::debug!("Sync already running; skipping");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let cancel = self.lifetime.child_token();
        *self.cycle_slot() = Some(cancel.clone());
        self.state.send_replace(SyncState::Syncing);
        tracing::info!("Sync started");

        let result = self.cycle(&cancel).await;
        *self.cycle_slot() = None;
        let refreshed = self.refresh_conflicts().await;

        match result {
            Ok(summary) if summary.cancelled() => {
                tracing::info!(
                    "Sync cancelled after {} uploads and {} downloads",
                    summary.upload.succeeded.len(),
                    summary.download.applied()
                );
                self.state.send_replace(SyncState::Idle);
                refreshed?;
                if self.lifetime.is_cancelled() {
                    Ok(RunOutcome::ShutDown)
                } else {
                    Ok(RunOutcome::Cancelled)
                }
            }
            Ok(summary) => {
                tracing::info!(
                    "Sync finished: {} uploaded, {} downloaded, {} conflicts",
                    summary.upload.succeeded.len(),
                    summary.download.applied(),
                    summary.conflict_count()
                );
                self.state.send_replace(SyncState::Success);
                refreshed?;
                Ok(RunOutcome::Completed(summary))
            }
            Err(error) => {
                tracing::warn!("Sync failed: {error}");
                self.state.send_replace(SyncState::Error(error.to_string()));
                Err(error)
            }
        }
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<SyncSummary> {
        let upload = UploadStage::new(&self.db, &self.gateway, self.clock.as_ref(), self.device_id())
            .run(cancel)
            .await?;
        if upload.cancelled {
            return Ok(SyncSummary {
                upload,
                download: DownloadReport::default(),
            });
        }

        let since = self.db.last_download_at().await?;
        let fetch_started = self.clock.now_millis();
        let download = DownloadStage::new(&self.db, &self.gateway, self.clock.as_ref())
            .run(since, cancel)
            .await?;

        {
            let mut snapshots = self.conflicts.remote_snapshots.lock().await;
            for conflict in &download.conflicts {
                if let Some(remote) = &conflict.remote {
                    snapshots.insert(conflict.record.entity_id.clone(), remote.clone());
                }
            }
        }

        if !download.cancelled {
            self.db.set_last_download_at(fetch_started).await?;
        }
        Ok(SyncSummary { upload, download })
    }

    /// Settle the conflict on `entity`. Waits for a running cycle to finish.
    pub async fn resolve(&self, entity: &EntityRef, strategy: ConflictStrategy) -> Result<Resolution> {
        if self.lifetime.is_cancelled() {
            return Err(Error::Sync("sync engine is shut down".to_string()));
        }
        let _guard = self.run_lock.lock().await;

        let resolution = ConflictResolver::new(&self.db, &self.gateway, &self.tracker)
            .resolve(entity, strategy)
            .await;
        self.refresh_conflicts().await?;
        resolution
    }

    /// Rebuild the conflicts observable from the store.
    pub async fn refresh_conflicts(&self) -> Result<Vec<SyncConflict>> {
        self.conflicts.refresh().await
    }

    /// Run cycles every `interval` until [`Self::shutdown`]. Failures are
    /// logged and retried on the next tick.
    pub async fn run_every(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.lifetime.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run().await {
                        Ok(RunOutcome::ShutDown) => break,
                        Ok(_) => {}
                        Err(error) => tracing::warn!("Scheduled sync failed: {error}"),
                    }
                }
            }
        }
    }

    /// Cancel the running cycle, if any. Later runs are unaffected.
    pub fn cancel(&self) {
        if let Some(token) = self.cycle_slot().as_ref() {
            tracing::info!("Cancelling sync");
            token.cancel();
        }
    }

    /// End the orchestrator's lifecycle: the running cycle is cancelled and
    /// every later [`Self::run`] returns [`RunOutcome::ShutDown`].
    pub fn shutdown(&self) {
        tracing::info!("Sync engine shutting down");
        self.lifetime.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    fn cycle_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current_cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<G> Drop for SyncOrchestrator<G> {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Published conflict list plus the remote copies seen by past downloads.
struct ConflictFeed {
    db: JournalDatabase,
    remote_snapshots: Mutex<HashMap<EntityRef, RemoteEntity>>,
    published: watch::Sender<Vec<SyncConflict>>,
}

impl ConflictFeed {
    /// Seeded with the persisted conflict records; local copies are filled
    /// in by the first refresh.
    fn new(db: JournalDatabase) -> Self {
        let seed = db
            .watch_conflict_records()
            .borrow()
            .iter()
            .cloned()
            .map(|record| SyncConflict {
                record,
                local: None,
                remote: None,
            })
            .collect();
        Self {
            db,
            remote_snapshots: Mutex::new(HashMap::new()),
            published: watch::channel(seed).0,
        }
    }

    /// Refresh on every change to the store's conflict records.
    async fn follow_store(self: Arc<Self>, lifetime: CancellationToken) {
        let mut records = self.db.watch_conflict_records();
        records.mark_changed();

        loop {
            tokio::select! {
                () = lifetime.cancelled() => break,
                changed = records.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if let Err(error) = self.refresh().await {
                tracing::warn!("Failed to refresh conflicts: {error}");
            }
        }
    }

    /// Rebuilds from a fresh read of the store. Refreshes are serialized by
    /// the snapshot lock, so the last one published is the newest.
    async fn refresh(&self) -> Result<Vec<SyncConflict>> {
        let mut snapshots = self.remote_snapshots.lock().await;
        let records = self.db.conflict_records().await?;
        snapshots.retain(|entity, _| records.iter().any(|record| &record.entity_id == entity));

        let mut conflicts = Vec::with_capacity(records.len());
        for record in records {
            let local = self.local_copy(&record).await?;
            let remote = snapshots.get(&record.entity_id).cloned();
            conflicts.push(SyncConflict {
                record,
                local,
                remote,
            });
        }

        self.published.send_replace(conflicts.clone());
        Ok(conflicts)
    }

    async fn local_copy(&self, record: &SyncRecord) -> Result<Option<Entry>> {
        match EntryId::from_entity_ref(&record.entity_id) {
            Ok(id) if !record.deleted => self.db.get_entry(&id).await,
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncRecord, SyncStatus};
    use crate::sync::testing::{Call, ScriptedGateway};
    use crate::sync::{GatewayError, Journal, ManualClock};
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct Fixture {
        journal: Journal,
        orchestrator: SyncOrchestrator<ScriptedGateway>,
        gateway: ScriptedGateway,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        async fn new() -> Self {
            let clock = Arc::new(ManualClock::new(100_000));
            let db = JournalDatabase::open_in_memory().await.unwrap();
            let device = db.load_or_create_device_id().await.unwrap();
            let gateway = ScriptedGateway::new(clock.clone());
            let journal = Journal::new(
                db.clone(),
                ChangeTracker::new(device.clone(), clock.clone()),
            );
            let orchestrator = SyncOrchestrator::new(db, gateway.clone(), clock.clone(), device);
            Self {
                journal,
                orchestrator,
                gateway,
                clock,
            }
        }

        async fn record(&self, id: &EntryId) -> SyncRecord {
            self.journal
                .database()
                .record(&id.entity_ref())
                .await
                .unwrap()
                .unwrap()
        }

        async fn content(&self, id: &EntryId) -> String {
            self.journal
                .database()
                .get_entry(id)
                .await
                .unwrap()
                .unwrap()
                .content
        }

        async fn sync(&self) -> SyncSummary {
            match self.orchestrator.run().await.unwrap() {
                RunOutcome::Completed(summary) => summary,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn end_to_end_scenario() {
        let fx = Fixture::new().await;
        let db = fx.journal.database();
        let ids: Vec<EntryId> = ["one", "two", "three"]
            .into_iter()
            .map(|content| fx.gateway.seed(content, 90_000).id)
            .collect();

        // Initial download of three remote entries.
        let report = DownloadStage::new(db, fx.orchestrator.gateway(), fx.clock.as_ref())
            .run(None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.inserted.len(), 3);
        for id in &ids {
            assert_eq!(fx.record(id).await.status, SyncStatus::Synced);
        }

        // Local edit of entry 1, then a full cycle.
        fx.clock.advance(1_000);
        fx.journal.update_entry(&ids[0], "one, edited").await.unwrap();
        let record = fx.record(&ids[0]).await;
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.version, 2);

        fx.clock.advance(1_000);
        let summary = fx.sync().await;
        assert_eq!(summary.upload.succeeded, vec![ids[0].entity_ref()]);
        assert_eq!(fx.record(&ids[0]).await.status, SyncStatus::Synced);
        assert_eq!(fx.gateway.remote(&ids[0]).unwrap().content, "one, edited");
        for id in &ids[1..] {
            let record = fx.record(id).await;
            assert_eq!(record.status, SyncStatus::Synced);
            assert_eq!(record.last_sync_time, Some(100_000));
        }

        // Entry 2 changes remotely and locally before the next cycle.
        fx.clock.advance(1_000);
        fx.gateway.remote_edit(ids[1], "two, remote");
        fx.clock.advance(1_000);
        fx.journal.update_entry(&ids[1], "two, local").await.unwrap();

        fx.clock.advance(1_000);
        let summary = fx.sync().await;
        assert_eq!(summary.upload.conflicts, vec![ids[1].entity_ref()]);
        assert_eq!(summary.conflict_count(), 1);
        assert_eq!(fx.record(&ids[1]).await.status, SyncStatus::Conflict);
        assert_eq!(fx.content(&ids[1]).await, "two, local");
        assert_eq!(fx.gateway.remote(&ids[1]).unwrap().content, "two, remote");
        assert_eq!(fx.orchestrator.state(), SyncState::Success);

        let conflicts = fx.orchestrator.subscribe_conflicts().borrow().clone();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            conflicts[0].remote.as_ref().map(|remote| remote.content.as_str()),
            Some("two, remote")
        );
        assert_eq!(fx.orchestrator.conflict_count().await.unwrap(), 1);
        assert_eq!(fx.orchestrator.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_run_returns_immediately() {
        let fx = Fixture::new().await;
        let gate = Arc::new(Notify::new());
        fx.gateway.gate_fetches(gate.clone());

        let (first, second) = tokio::join!(fx.orchestrator.run(), async {
            let outcome = fx.orchestrator.run().await;
            let calls_seen = fx.gateway.calls().len();
            gate.notify_one();
            (outcome, calls_seen)
        });

        assert!(matches!(first.unwrap(), RunOutcome::Completed(_)));
        let (outcome, calls_seen) = second;
        assert_eq!(outcome.unwrap(), RunOutcome::AlreadyRunning);
        assert_eq!(calls_seen, 0);
        assert_eq!(fx.gateway.calls(), vec![Call::FetchChanges(None)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthorized_sets_error_state() {
        let fx = Fixture::new().await;
        let entry = fx.journal.create_entry("private").await.unwrap();
        fx.gateway
            .fail_all(GatewayError::Unauthorized("bad token".into()));
        let mut state = fx.orchestrator.subscribe_state();

        let error = fx.orchestrator.run().await.unwrap_err();
        assert!(error.is_unauthorized());
        assert!(state.has_changed().unwrap());
        assert!(matches!(&*state.borrow_and_update(), SyncState::Error(message) if message.contains("bad token")));
        assert_eq!(fx.record(&entry.id).await.status, SyncStatus::Pending);

        // The next run recovers once credentials work again.
        fx.gateway.clear_failures();
        fx.sync().await;
        assert_eq!(fx.orchestrator.state(), SyncState::Success);
        assert_eq!(fx.record(&entry.id).await.status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watermark_advances_only_after_success() {
        let fx = Fixture::new().await;
        fx.gateway
            .fail_fetch(GatewayError::Network("offline".into()));
        assert!(fx.orchestrator.run().await.is_err());
        assert_eq!(fx.journal.database().last_download_at().await.unwrap(), None);

        fx.gateway.clear_failures();
        fx.sync().await;
        assert_eq!(
            fx.journal.database().last_download_at().await.unwrap(),
            Some(100_000)
        );

        fx.clock.advance(10);
        fx.sync().await;
        assert_eq!(
            fx.gateway.calls().last(),
            Some(&Call::FetchChanges(Some(100_000)))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_during_fetch_returns_to_idle() {
        let fx = Fixture::new().await;
        fx.gateway.seed("remote only", 1);
        let gate = Arc::new(Notify::new());
        fx.gateway.gate_fetches(gate.clone());

        let (outcome, ()) = tokio::join!(fx.orchestrator.run(), async {
            fx.orchestrator.cancel();
            gate.notify_one();
        });

        assert_eq!(outcome.unwrap(), RunOutcome::Cancelled);
        assert_eq!(fx.orchestrator.state(), SyncState::Idle);
        assert_eq!(fx.journal.database().count_entries().await.unwrap(), 0);
        assert_eq!(fx.journal.database().last_download_at().await.unwrap(), None);

        // Nothing is lost: the next cycle applies the change.
        gate.notify_one();
        fx.sync().await;
        assert_eq!(fx.journal.database().count_entries().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_ends_lifecycle() {
        let fx = Fixture::new().await;
        fx.orchestrator.shutdown();

        assert!(fx.orchestrator.is_shut_down());
        assert_eq!(fx.orchestrator.run().await.unwrap(), RunOutcome::ShutDown);
        assert!(fx
            .orchestrator
            .resolve(&EntryId::new().entity_ref(), ConflictStrategy::LocalWins)
            .await
            .is_err());
        assert!(fx.gateway.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_clears_published_conflict() {
        let fx = Fixture::new().await;
        let entry = fx.journal.create_entry("base").await.unwrap();
        fx.sync().await;

        fx.clock.advance(10);
        fx.gateway.remote_edit(entry.id, "remote");
        fx.clock.advance(10);
        fx.journal.update_entry(&entry.id, "local").await.unwrap();
        fx.clock.advance(10);
        fx.sync().await;

        let mut conflicts = fx.orchestrator.subscribe_conflicts();
        assert_eq!(conflicts.borrow_and_update().len(), 1);

        let resolution = fx
            .orchestrator
            .resolve(&entry.entity_ref(), ConflictStrategy::RemoteWins)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Synced);
        assert!(conflicts.borrow_and_update().is_empty());
        assert_eq!(fx.content(&entry.id).await, "remote");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicts_seeded_from_store() {
        let clock = Arc::new(ManualClock::new(100_000));
        let db = JournalDatabase::open_in_memory().await.unwrap();
        let device = db.load_or_create_device_id().await.unwrap();
        let journal = Journal::new(
            db.clone(),
            ChangeTracker::new(device.clone(), clock.clone()),
        );
        let entry = journal.create_entry("stuck").await.unwrap();
        db.mark_status(&entry.entity_ref(), SyncStatus::Conflict)
            .await
            .unwrap();

        let orchestrator =
            SyncOrchestrator::new(db, ScriptedGateway::new(clock.clone()), clock, device);
        let mut conflicts = orchestrator.subscribe_conflicts();
        assert_eq!(conflicts.borrow().len(), 1);
        assert_eq!(conflicts.borrow()[0].record.entity_id, entry.entity_ref());

        let seeded = timeout(
            Duration::from_secs(5),
            conflicts.wait_for(|conflicts| conflicts.iter().all(|c| c.local.is_some())),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].local.as_ref(), Some(&entry));
        assert!(seeded[0].remote.is_none());

        let refreshed = orchestrator.refresh_conflicts().await.unwrap();
        assert_eq!(refreshed, seeded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicts_follow_journal_edits() {
        let fx = Fixture::new().await;
        let entry = fx.journal.create_entry("base").await.unwrap();
        fx.sync().await;

        fx.clock.advance(10);
        fx.gateway.remote_edit(entry.id, "remote");
        fx.clock.advance(10);
        fx.journal.update_entry(&entry.id, "local").await.unwrap();
        fx.clock.advance(10);
        fx.sync().await;

        let mut conflicts = fx.orchestrator.subscribe_conflicts();
        assert_eq!(conflicts.borrow_and_update().len(), 1);

        // Editing a conflicted entry takes it out of conflict without any
        // call on the orchestrator.
        fx.journal.update_entry(&entry.id, "merged by hand").await.unwrap();
        timeout(
            Duration::from_secs(5),
            conflicts.wait_for(|conflicts| conflicts.is_empty()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(fx.record(&entry.id).await.status, SyncStatus::Pending);

        // And a conflict raised outside a cycle shows up the same way.
        fx.journal
            .database()
            .mark_status(&entry.entity_ref(), SyncStatus::Conflict)
            .await
            .unwrap();
        let raised = timeout(
            Duration::from_secs(5),
            conflicts.wait_for(|conflicts| conflicts.len() == 1),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(raised[0].record.entity_id, entry.entity_ref());
    }
}
