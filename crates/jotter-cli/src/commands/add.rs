use std::path::Path;

use crate::commands::common::{open_journal, resolve_entry_content};
use crate::error::CliError;

pub async fn run_add(content_parts: &[String], db_path: &Path) -> Result<(), CliError> {
    let content = resolve_entry_content(content_parts)?;

    let journal = open_journal(db_path).await?;
    let entry = journal.create_entry(&content).await?;

    println!("{}", entry.id);
    Ok(())
}
