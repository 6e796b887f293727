use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::info;

use trellis_core::config::{Credentials, TrellisConfig};
use trellis_core::progress::IndicatifReporter;
use trellis_core::source::{ForgeClient, TrackerClient};
use trellis_core::sync::{SyncEngine, SyncOptions};
use trellis_core::types::SyncReport;

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "trellis.toml")]
    pub config: PathBuf,

    /// Path to the graph database (created if missing)
    #[arg(long, default_value = super::DEFAULT_DB)]
    pub db: PathBuf,

    /// Ignore the stored activity watermark and fetch the default window
    #[arg(long)]
    pub full: bool,
}

/// The pass finished but some records could not be written or linked.
#[derive(thiserror::Error, Debug)]
#[error("Sync completed with {errors} record-level error(s)")]
pub struct PartialSync {
    pub errors: u64,
}

pub async fn run(args: SyncArgs, quiet: bool) -> anyhow::Result<()> {
    let config = TrellisConfig::load(&args.config)
        .with_context(|| format!("Cannot load config: {}", args.config.display()))?;
    let patterns = config
        .compile_patterns()
        .context("Cannot compile config patterns")?;
    let credentials = Credentials::from_env(&config).context("Cannot resolve credentials")?;

    let store = super::open_store(&args.db)?;

    let tracker = match credentials.tracker_token.clone() {
        Some(token) => Some(
            TrackerClient::new(&config.tracker, credentials.tracker_username.clone(), token)
                .context("Cannot build tracker client")?,
        ),
        None => None,
    };
    let forge = match credentials.forge_token.clone() {
        Some(token) => Some(
            ForgeClient::new(&config.source_control, token)
                .context("Cannot build source-control client")?,
        ),
        None => None,
    };

    if args.full {
        info!("Full mode: ignoring stored activity watermark");
    }

    let progress = IndicatifReporter::new(!quiet);
    let mut engine = SyncEngine::new(&store, &config, &patterns).with_progress(&progress);
    if let Some(tracker) = &tracker {
        engine = engine.with_issue_source(tracker);
    }
    if let Some(forge) = &forge {
        engine = engine.with_activity_source(forge);
    }

    let report = engine
        .run(SyncOptions { full: args.full })
        .await
        .context("Sync pass failed")?;

    if !quiet {
        print_report(&report, &args.db);
    }

    let errors = report.error_count();
    if errors > 0 {
        return Err(PartialSync { errors }.into());
    }
    Ok(())
}

fn print_report(report: &SyncReport, db: &std::path::Path) {
    println!("Trellis sync into {}", db.display());
    println!();
    println!("  Entities upserted: {}", report.total_upserted());
    for (kind, count) in &report.entities_upserted {
        println!("    {kind:<20} {count:>6}");
    }
    println!("  Edges created:     {}", report.total_edges_created());
    for (kind, count) in &report.edges_created {
        println!("    {kind:<20} {count:>6}");
    }
    println!(
        "  Closed items:      {} retained, {} dropped",
        report.closed_retained, report.closed_dropped
    );
    println!("  Skipped malformed: {}", report.skipped_malformed);
    println!("  Duration:          {:.2?}", report.duration);

    if !report.errors.is_empty() {
        println!();
        println!("  Warnings ({}):", report.errors.len());
        for error in &report.errors {
            println!("    - {error}");
        }
    }
}
