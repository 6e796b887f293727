pub mod status;
pub mod sync;

use std::path::Path;

use anyhow::Context;
use clap::Subcommand;

use trellis_core::store::SqliteStore;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one sync pass: fetch, upsert, resolve references, derive hierarchy
    Sync(sync::SyncArgs),
    /// Show graph statistics and the last pass report
    Status(status::StatusArgs),
}

pub async fn run(cmd: Command, quiet: bool) -> anyhow::Result<()> {
    match cmd {
        Command::Sync(args) => sync::run(args, quiet).await,
        Command::Status(args) => status::run(args).await,
    }
}

/// Default database location, relative to the working directory.
pub const DEFAULT_DB: &str = "trellis.db";

pub(crate) fn open_store(path: &Path) -> anyhow::Result<SqliteStore> {
    SqliteStore::open(path).with_context(|| format!("Cannot open database: {}", path.display()))
}
