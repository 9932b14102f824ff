//! Mirror statistics.

use crate::cli::commands::{format_millis, open_storage, paint_status};
use crate::error::Result;
use std::path::PathBuf;

/// Print row counts and the five most recent jobs.
///
/// # Errors
///
/// Returns an error if the database is missing or a query fails.
pub fn execute(db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let storage = open_storage(db_path)?;
    let stats = storage.stats()?;

    if json {
        println!("{}", serde_json::to_string(&stats)?);
        return Ok(());
    }

    println!("Mirror statistics");
    println!("=================");
    println!("  Documents:  {}", stats.documents);
    println!("  Workspaces: {}", stats.workspaces);
    println!("  Elements:   {}", stats.elements);
    println!("  Parts:      {}", stats.parts);
    println!("  Features:   {}", stats.features);
    println!("  Sync jobs:  {}", stats.sync_jobs);

    if !stats.recent_jobs.is_empty() {
        println!();
        println!("Recent jobs:");
        for job in &stats.recent_jobs {
            println!(
                "  #{:<5} {:<11} {:<20} {}  {}",
                job.id,
                job.kind,
                paint_status(job.status),
                format_millis(job.started_at),
                job.message.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}
