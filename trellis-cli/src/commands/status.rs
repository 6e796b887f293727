use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use trellis_core::store::GraphStore;
use trellis_core::sync::{WATERMARK_CHECKPOINT, last_report};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Path to the graph database
    #[arg(long, default_value = super::DEFAULT_DB)]
    pub db: PathBuf,
}

pub async fn run(args: StatusArgs) -> anyhow::Result<()> {
    if !args.db.exists() {
        anyhow::bail!(
            "Database not found: {}. Run `trellis sync` first.",
            args.db.display()
        );
    }

    let store = super::open_store(&args.db)?;
    let stats = store.stats().await.context("Failed to read store stats")?;

    println!("Trellis status for {}", args.db.display());
    println!();
    if stats.db_size_bytes > 0 {
        println!("  Size:     {}", format_bytes(stats.db_size_bytes));
        println!();
    }

    println!("  Nodes: {} total", stats.total_nodes);
    print_counts(&stats.nodes_by_kind);
    println!();

    println!("  Edges: {} total", stats.total_edges);
    print_counts(&stats.edges_by_kind);
    println!();

    let watermark = store
        .get_checkpoint(WATERMARK_CHECKPOINT)
        .await
        .context("Failed to read checkpoints")?;
    println!("  Checkpoints:");
    println!(
        "    {WATERMARK_CHECKPOINT}: {}",
        watermark.as_deref().unwrap_or("(none)")
    );
    println!();

    match last_report(&store)
        .await
        .context("Failed to read last sync report")?
    {
        Some(report) => {
            println!("  Last sync:");
            if let Some(started) = report.started_at {
                println!("    Started:           {}", started.to_rfc3339());
            }
            println!("    Entities upserted: {}", report.total_upserted());
            println!("    Edges created:     {}", report.total_edges_created());
            println!(
                "    Closed items:      {} retained, {} dropped",
                report.closed_retained, report.closed_dropped
            );
            println!("    Errors:            {}", report.error_count());
            println!("    Duration:          {:.2?}", report.duration);
        }
        None => println!("  Last sync: never"),
    }

    Ok(())
}

/// Print kinds by descending count, ties by name.
fn print_counts(counts: &HashMap<String, u64>) {
    let mut kinds: Vec<_> = counts.iter().collect();
    kinds.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (kind, count) in &kinds {
        println!("    {kind:<20} {count:>6}");
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
