//! Jotter CLI - Command-line interface for an offline-first journal
//!
//! Entries are written locally first; `jotter sync` reconciles them with the
//! remote journal API.

mod cli;
mod commands;
mod error;

use clap::{CommandFactory, Parser};
use jotter_core::config::SyncConfig;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::add::run_add;
use crate::commands::common::resolve_db_path;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::sync::{
    run_sync, run_sync_conflicts, run_sync_resolve, run_sync_status, strategy_from_flags,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "jotter=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Some(Commands::Add { content }) => run_add(&content, &db_path).await?,
        Some(Commands::List { limit, tag, json }) => {
            run_list(limit, tag.as_deref(), json, &db_path).await?;
        }
        Some(Commands::Edit { id }) => run_edit(&id, &db_path).await?,
        Some(Commands::Delete { id }) => run_delete(&id, &db_path).await?,
        Some(Commands::Sync { command, watch }) => match command {
            None => run_sync(SyncConfig::from_env()?, watch, &db_path).await?,
            Some(SyncCommands::Status { json }) => {
                let configured = SyncConfig::from_env()?.is_some_and(|config| config.is_configured());
                run_sync_status(configured, json, &db_path).await?;
            }
            Some(SyncCommands::Conflicts { json }) => run_sync_conflicts(json, &db_path).await?,
            Some(SyncCommands::Resolve {
                id,
                local,
                remote,
                manual,
            }) => {
                let strategy = strategy_from_flags(local, remote, manual)?;
                run_sync_resolve(SyncConfig::from_env()?, &id, strategy, &db_path).await?;
            }
        },
        None => {
            // Quick capture mode: jotter "my thought"
            if cli.entry.is_empty() {
                Cli::command().print_help().map_err(CliError::Io)?;
                println!();
            } else {
                run_add(&cli.entry, &db_path).await?;
            }
        }
    }

    Ok(())
}
