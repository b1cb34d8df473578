use std::path::Path;
use std::sync::Arc;

use jotter_core::config::SyncConfig;
use jotter_core::sync::{ConflictStrategy, Resolution, RunOutcome, SyncSummary};
use jotter_core::{EntryId, JournalDatabase, SyncConflict, SyncState};
use serde::Serialize;

use crate::commands::common::{
    conflict_to_item, entity_label, format_conflict_lines, format_sync_timestamp,
    normalize_entry_identifier, open_database, open_orchestrator, resolve_conflict_record,
    ConflictItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncStatusItem {
    pub configured: bool,
    pub pending: usize,
    pub conflicts: usize,
    pub last_download_at: Option<i64>,
    pub last_download_iso: Option<String>,
}

pub async fn run_sync(
    config: Option<SyncConfig>,
    watch: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let orchestrator = Arc::new(open_orchestrator(db_path, config.as_ref()).await?);

    if watch {
        let interval = config
            .and_then(|config| config.sync_interval)
            .ok_or(CliError::AutoSyncDisabled)?;

        let signal_target = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_target.shutdown();
            }
        });

        let mut states = orchestrator.subscribe_state();
        let reporter = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                match state {
                    SyncState::Error(message) => eprintln!("Sync failed: {message}"),
                    other => tracing::info!("Sync {}", other.label()),
                }
            }
        });

        println!("Syncing every {}s, press Ctrl-C to stop", interval.as_secs());
        orchestrator.run_every(interval).await;
        reporter.abort();
        println!("Sync stopped");
        return Ok(());
    }

    let signal_target = Arc::clone(&orchestrator);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_target.cancel();
        }
    });
    let outcome = orchestrator.run().await;
    interrupt.abort();

    match outcome? {
        RunOutcome::Completed(summary) => {
            for line in format_summary_lines(&summary) {
                println!("{line}");
            }
        }
        RunOutcome::AlreadyRunning => println!("A sync is already running"),
        RunOutcome::Cancelled | RunOutcome::ShutDown => {
            println!("Sync cancelled; unsent changes stay pending");
        }
    }
    Ok(())
}

pub async fn run_sync_status(
    configured: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let last_download_at = db.last_download_at().await?;
    let status = SyncStatusItem {
        configured,
        pending: db.pending_count().await?,
        conflicts: db.conflict_count().await?,
        last_download_at,
        last_download_iso: last_download_at.map(format_sync_timestamp),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "Remote:        {}",
        if status.configured { "configured" } else { "not configured" }
    );
    println!("Pending:       {}", status.pending);
    println!("Conflicts:     {}", status.conflicts);
    println!(
        "Last download: {}",
        status.last_download_iso.as_deref().unwrap_or("never")
    );
    Ok(())
}

pub async fn run_sync_conflicts(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let conflicts = load_conflicts(&db).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_resolve(
    config: Option<SyncConfig>,
    id: &str,
    strategy: ConflictStrategy,
    db_path: &Path,
) -> Result<(), CliError> {
    let query = normalize_entry_identifier(id)?;
    let orchestrator = open_orchestrator(db_path, config.as_ref()).await?;

    let records = orchestrator.database().conflict_records().await?;
    let entity = resolve_conflict_record(&query, &records)?.entity_id.clone();

    match orchestrator.resolve(&entity, strategy).await? {
        Resolution::Synced => println!("{} resolved and synced", entity.local_id()),
        Resolution::Purged => println!("{} resolved as deleted", entity.local_id()),
        Resolution::Deferred(reason) => println!(
            "{} resolved locally; push will be retried on next sync ({reason})",
            entity.local_id()
        ),
    }
    Ok(())
}

pub fn strategy_from_flags(
    local: bool,
    remote: bool,
    manual: Option<String>,
) -> Result<ConflictStrategy, CliError> {
    match (local, remote, manual) {
        (true, false, None) => Ok(ConflictStrategy::LocalWins),
        (false, true, None) => Ok(ConflictStrategy::RemoteWins),
        (false, false, Some(text)) => Ok(ConflictStrategy::Manual(text)),
        _ => Err(CliError::InvalidStrategy),
    }
}

/// Conflicted records with their local side. Remote snapshots are only
/// known to the process that downloaded them, so they are left out here.
pub async fn load_conflicts(db: &JournalDatabase) -> Result<Vec<SyncConflict>, CliError> {
    let mut conflicts = Vec::new();
    for record in db.conflict_records().await? {
        let local = match EntryId::from_entity_ref(&record.entity_id) {
            Ok(id) if !record.deleted => db.get_entry(&id).await?,
            _ => None,
        };
        conflicts.push(SyncConflict {
            record,
            local,
            remote: None,
        });
    }
    Ok(conflicts)
}

pub fn format_summary_lines(summary: &SyncSummary) -> Vec<String> {
    let upload = &summary.upload;
    let download = &summary.download;

    let mut lines = vec![
        format!(
            "Uploaded {} change(s), {} failed",
            upload.succeeded.len(),
            upload.failed.len()
        ),
        format!(
            "Downloaded {} new, {} updated, {} deleted",
            download.inserted.len(),
            download.updated.len(),
            download.deleted.len()
        ),
    ];
    lines.extend(
        upload
            .failed
            .iter()
            .map(|(entity, reason)| format!("  failed {}: {reason}", entity_label(entity))),
    );

    let conflicts = summary.conflict_count();
    if conflicts > 0 {
        lines.push(format!(
            "{conflicts} conflict(s); see `jotter sync conflicts`"
        ));
    }
    lines
}
