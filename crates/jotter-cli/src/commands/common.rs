use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use jotter_core::config::SyncConfig;
use jotter_core::sync::{HttpGateway, Journal, SyncOrchestrator, SystemClock};
use jotter_core::util::short_id;
use jotter_core::{EntityRef, Entry, EntryId, JournalDatabase, SyncConflict, SyncRecord};
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct EntryListItem {
    pub id: String,
    pub preview: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub entity: String,
    pub version: u64,
    pub last_modified: i64,
    pub last_modified_iso: String,
    pub device_id: String,
    pub local_deleted: bool,
    pub preview: Option<String>,
}

pub async fn list_entries(
    limit: usize,
    tag: Option<&str>,
    db_path: &Path,
) -> Result<Vec<Entry>, CliError> {
    let db = open_database(db_path).await?;
    if let Some(tag_name) = tag {
        Ok(db.list_entries_by_tag(tag_name, limit, 0).await?)
    } else {
        Ok(db.list_entries(limit, 0).await?)
    }
}

pub async fn resolve_entry(entry_query: &str, db: &JournalDatabase) -> Result<Entry, CliError> {
    if let Ok(entry_id) = entry_query.parse::<EntryId>() {
        if let Some(entry) = db.get_entry(&entry_id).await? {
            return Ok(entry);
        }
    }

    let matching_ids = db.list_entry_ids_by_prefix(entry_query, 3).await?;

    match matching_ids.as_slice() {
        [] => Err(CliError::EntryNotFound(entry_query.to_string())),
        [only] => {
            let resolved_id = only
                .parse::<EntryId>()
                .map_err(|_| CliError::EntryNotFound(entry_query.to_string()))?;
            db.get_entry(&resolved_id)
                .await?
                .ok_or_else(|| CliError::EntryNotFound(entry_query.to_string()))
        }
        _ => Err(ambiguous(entry_query, matching_ids.iter().map(String::as_str))),
    }
}

/// Pick the conflicted record whose id matches `query` exactly or by prefix.
///
/// Matches against the records rather than the entries table, since a
/// conflicted local deletion has no entry row left.
pub fn resolve_conflict_record<'a>(
    query: &str,
    records: &'a [SyncRecord],
) -> Result<&'a SyncRecord, CliError> {
    if let Some(exact) = records
        .iter()
        .find(|record| record.entity_id.local_id() == query)
    {
        return Ok(exact);
    }

    let matches = records
        .iter()
        .filter(|record| record.entity_id.local_id().starts_with(query))
        .collect::<Vec<_>>();

    match matches.as_slice() {
        [] => Err(CliError::ConflictNotFound(query.to_string())),
        [only] => Ok(only),
        _ => Err(ambiguous(
            query,
            matches.iter().map(|record| record.entity_id.local_id()),
        )),
    }
}

fn ambiguous<'a>(query: &str, ids: impl Iterator<Item = &'a str>) -> CliError {
    let options = ids.take(3).map(short_id).collect::<Vec<_>>().join(", ");
    CliError::AmbiguousEntryId(format!(
        "ID prefix '{query}' is ambiguous; matches: {options}"
    ))
}

pub fn format_entry_lines(entries: &[Entry]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    entries
        .iter()
        .map(|entry| {
            let short_id = short_id(&entry.id.to_string());
            let preview = entry_preview(&entry.content, 40);
            let relative_time = format_relative_time(entry.updated_at, now_ms);
            let tags = render_tags(entry);

            if tags.is_empty() {
                format!("{short_id:<13}  {preview:<40}  {relative_time}")
            } else {
                format!("{short_id:<13}  {preview:<40}  {relative_time:<10}  {tags}")
            }
        })
        .collect()
}

pub fn entry_to_list_item(entry: &Entry) -> EntryListItem {
    let now_ms = Utc::now().timestamp_millis();
    let mut tags = entry.tags();
    tags.sort();

    EntryListItem {
        id: entry.id.to_string(),
        preview: entry_preview(&entry.content, 80),
        content: entry.content.clone(),
        created_at: entry.created_at,
        updated_at: entry.updated_at,
        relative_time: format_relative_time(entry.updated_at, now_ms),
        tags,
    }
}

pub fn conflict_to_item(conflict: &SyncConflict) -> ConflictItem {
    let record = &conflict.record;
    ConflictItem {
        entity: record.entity_id.to_string(),
        version: record.version,
        last_modified: record.last_modified,
        last_modified_iso: format_sync_timestamp(record.last_modified),
        device_id: record.device_id.to_string(),
        local_deleted: conflict.is_local_deletion(),
        preview: conflict
            .local
            .as_ref()
            .map(|entry| entry_preview(&entry.content, 80)),
    }
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let record = &conflict.record;
            let local = conflict.local.as_ref().map_or_else(
                || "(deleted locally)".to_string(),
                |entry| entry_preview(&entry.content, 40),
            );
            format!(
                "{:<13}  {local:<40}  v{}  modified {}",
                short_id(record.entity_id.local_id()),
                record.version,
                format_sync_timestamp(record.last_modified)
            )
        })
        .collect()
}

pub fn entry_preview(content: &str, max_chars: usize) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn render_tags(entry: &Entry) -> String {
    let mut tags = entry.tags();
    tags.sort();
    tags.into_iter()
        .map(|tag| format!("#{tag}"))
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn resolve_entry_content(content_parts: &[String]) -> Result<String, CliError> {
    if let Some(content) = normalize_content(&content_parts.join(" ")) {
        return Ok(content);
    }

    if let Some(content) = read_piped_stdin()? {
        return Ok(content);
    }

    if let Some(content) = capture_editor_input()? {
        return Ok(content);
    }

    Err(CliError::EmptyContent)
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_entry_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyEntryId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

pub fn capture_editor_input() -> Result<Option<String>, CliError> {
    capture_editor_input_with_initial("")
}

pub fn capture_editor_input_with_initial(
    initial_content: &str,
) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_entry_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let entry_content = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(normalize_content(&entry_content))
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    let status = match Command::new(editor).arg(file_path).status() {
        Ok(status) => status,
        // `EDITOR="code --wait"` style values
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };
            Command::new(program).args(parts).arg(file_path).status()?
        }
        Err(err) => return Err(CliError::Io(err)),
    };

    if status.success() {
        Ok(())
    } else {
        Err(CliError::EditorFailed(format!(
            "`{editor}` exited with status {status}"
        )))
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_entry_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("jotter-entry-{}-{now}.md", std::process::id()))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("JOTTER_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jotter")
        .join("jotter.db")
}

pub async fn open_database(path: &Path) -> Result<JournalDatabase, CliError> {
    Ok(JournalDatabase::open_path(path).await?)
}

pub async fn open_journal(path: &Path) -> Result<Journal, CliError> {
    let db = open_database(path).await?;
    Ok(Journal::open(db).await?)
}

/// Open the local database together with a gateway to the configured remote.
pub async fn open_orchestrator(
    path: &Path,
    config: Option<&SyncConfig>,
) -> Result<SyncOrchestrator<HttpGateway>, CliError> {
    let config = config
        .filter(|config| config.is_configured())
        .ok_or(CliError::SyncNotConfigured)?;
    let gateway = HttpGateway::from_config(config)?;

    let db = open_database(path).await?;
    let device_id = db.load_or_create_device_id().await?;
    tracing::debug!("Syncing {} as device {device_id}", gateway.base_url());
    Ok(SyncOrchestrator::new(
        db,
        gateway,
        Arc::new(SystemClock),
        device_id,
    ))
}

pub fn entity_label(entity: &EntityRef) -> String {
    short_id(entity.local_id())
}
