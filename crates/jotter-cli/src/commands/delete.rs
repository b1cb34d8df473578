use std::path::Path;

use crate::commands::common::{normalize_entry_identifier, open_journal, resolve_entry};
use crate::error::CliError;

pub async fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_entry_identifier(id)?;
    let journal = open_journal(db_path).await?;
    let entry = resolve_entry(&normalized_id, journal.database()).await?;

    journal.delete_entry(&entry.id).await?;
    println!("{}", entry.id);
    Ok(())
}
