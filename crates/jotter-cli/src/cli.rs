use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jotter")]
#[command(about = "Keep a journal that syncs when the network allows")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Quick capture: jotter "my thought here"
    #[arg(trailing_var_arg = true)]
    pub entry: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new entry
    #[command(alias = "new")]
    Add {
        /// Entry content
        content: Vec<String>,
    },
    /// List recent entries
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Filter entries by tag name
        #[arg(long)]
        tag: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing entry
    Edit {
        /// Entry ID or unique ID prefix
        id: String,
    },
    /// Delete an existing entry
    Delete {
        /// Entry ID or unique ID prefix
        id: String,
    },
    /// Sync with the remote journal (JOTTER_API_URL / JOTTER_API_TOKEN)
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
        /// Keep syncing every JOTTER_SYNC_INTERVAL_SECS until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show pending changes, open conflicts and the last download time
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List entries whose local and remote changes collided
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle a conflict
    #[command(group(
        ArgGroup::new("strategy")
            .required(true)
            .args(["local", "remote", "manual"])
    ))]
    Resolve {
        /// Entry ID or unique ID prefix
        id: String,
        /// Keep the local version and overwrite the remote
        #[arg(long)]
        local: bool,
        /// Take the remote version
        #[arg(long)]
        remote: bool,
        /// Replace both sides with this merged text
        #[arg(long, value_name = "TEXT")]
        manual: Option<String>,
    },
}
