//! Sync command implementation.
//!
//! Each invocation submits one task to a worker pool, acknowledges it, then
//! waits for the pool to drain since the workers die with the process.

use crate::cli::SyncCommands;
use crate::cli::commands::{open_storage, paint_status};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::JobStatus;
use crate::remote::OnshapeClient;
use crate::storage::SharedStorage;
use crate::sync::{EngineSettings, SyncEngine, SyncOutcome, TaskReport, WorkerPool};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Serialize)]
struct SyncOutput<'a> {
    task_id: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Execute a sync command.
///
/// # Errors
///
/// Returns an error if the database or client cannot be set up, or
/// `Error::Sync` when the job ended in `error`.
pub fn execute(
    command: &SyncCommands,
    db_path: Option<&PathBuf>,
    settings: &Settings,
    json: bool,
) -> Result<()> {
    let storage = SharedStorage::new(open_storage(db_path)?);
    let client = OnshapeClient::new(settings)?;

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Other(format!("Failed to create tokio runtime: {e}")))?;

    rt.block_on(run(command, storage, client, settings, json))
}

async fn run(
    command: &SyncCommands,
    storage: SharedStorage,
    client: OnshapeClient,
    settings: &Settings,
    json: bool,
) -> Result<()> {
    let engine = Arc::new(SyncEngine::new(
        Arc::new(client),
        storage,
        EngineSettings::from(settings),
    ));
    engine.jobs().recover_abandoned()?;

    let pool = WorkerPool::new(
        Arc::clone(&engine),
        settings.worker_count,
        settings.cascade_timeout(),
    );
    let handle = pool.submit(command.to_request())?;

    if !json {
        println!(
            "Accepted {} sync (task {})",
            handle.kind.as_str(),
            handle.task_id
        );
    }

    let reports = pool.drain().await;
    let mut failed = None;

    for report in &reports {
        print_report(report, json)?;
        match &report.outcome {
            Ok(outcome) if outcome.status == JobStatus::Error => {
                failed = Some(Error::Sync(format!(
                    "job {} ended in error: {}",
                    outcome.job_id, outcome.message
                )));
            }
            Ok(_) => {}
            Err(e) => failed = Some(Error::Sync(e.to_string())),
        }
    }

    failed.map_or(Ok(()), Err)
}

fn print_report(report: &TaskReport, json: bool) -> Result<()> {
    if json {
        let output = SyncOutput {
            task_id: &report.task_id,
            kind: report.kind.as_str(),
            outcome: report.outcome.as_ref().ok(),
            error: report.outcome.as_ref().err().map(ToString::to_string),
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    match &report.outcome {
        Ok(outcome) => {
            println!(
                "Job {} {}: {}",
                outcome.job_id,
                paint_status(outcome.status),
                outcome.message
            );
            println!(
                "  processed: {}  errors: {}  skipped: {}",
                outcome.processed, outcome.errors, outcome.skipped
            );
            for note in &outcome.notes {
                println!("  note: {note}");
            }
        }
        Err(e) => println!("Task {} failed before recording a job: {e}", report.task_id),
    }
    Ok(())
}
