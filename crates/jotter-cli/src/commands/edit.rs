use std::path::Path;

use crate::commands::common::{
    capture_editor_input_with_initial, normalize_entry_identifier, open_journal, resolve_entry,
};
use crate::error::CliError;

pub async fn run_edit(id: &str, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_entry_identifier(id)?;
    let journal = open_journal(db_path).await?;
    let entry = resolve_entry(&normalized_id, journal.database()).await?;

    let Some(edited_content) = capture_editor_input_with_initial(&entry.content)? else {
        return Err(CliError::EmptyEditedContent);
    };

    // Unchanged text is not a change; nothing to sync
    if edited_content == entry.content {
        println!("{}", entry.id);
        return Ok(());
    }

    let updated = journal.update_entry(&entry.id, &edited_content).await?;
    println!("{}", updated.id);
    Ok(())
}
