//! Job history commands.

use crate::cli::commands::{format_millis, open_storage, paint_status};
use crate::cli::{JobsCommands, JobsListArgs};
use crate::error::{Error, Result};
use crate::model::SyncJob;
use crate::storage::JobFilter;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct JobListOutput<'a> {
    count: usize,
    jobs: &'a [SyncJob],
}

#[derive(Serialize)]
struct JobShowOutput<'a> {
    job: &'a SyncJob,
    children: &'a [SyncJob],
}

/// Execute jobs commands.
///
/// # Errors
///
/// Returns an error if the database is missing or a query fails.
pub fn execute(command: &JobsCommands, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    match command {
        JobsCommands::List(args) => list(args, db_path, json),
        JobsCommands::Show { id } => show(*id, db_path, json),
    }
}

fn list(args: &JobsListArgs, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let storage = open_storage(db_path)?;
    let jobs = storage.list_jobs(&JobFilter {
        kind: args.kind,
        status: args.status,
        parent: None,
        roots_only: args.roots,
        limit: args.limit,
        offset: args.offset,
    })?;

    if crate::is_csv() {
        println!("id,parent_id,kind,status,processed,errors,started_at,message");
        for job in &jobs {
            println!(
                "{},{},{},{},{},{},{},{}",
                job.id,
                job.parent_id.map(|p| p.to_string()).unwrap_or_default(),
                job.kind,
                job.status.as_str(),
                job.records_processed,
                job.errors_count,
                job.started_at,
                crate::csv_escape(job.message.as_deref().unwrap_or(""))
            );
        }
    } else if json {
        let output = JobListOutput {
            count: jobs.len(),
            jobs: &jobs,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else if jobs.is_empty() {
        println!("No sync jobs found.");
    } else {
        println!("Sync jobs ({} shown):", jobs.len());
        println!();
        for job in &jobs {
            print_job_line(job, "");
        }
    }

    Ok(())
}

fn show(id: i64, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let storage = open_storage(db_path)?;
    let job = storage.get_job(id)?.ok_or_else(|| Error::NotFound {
        entity: "Job",
        id: id.to_string(),
    })?;
    let children = storage.job_children(id)?;

    if json {
        let output = JobShowOutput {
            job: &job,
            children: &children,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("Job {} ({})", job.id, job.kind);
    println!("  Status:    {}", paint_status(job.status));
    if let Some(parent) = job.parent_id {
        println!("  Parent:    {parent}");
    }
    println!("  Started:   {}", format_millis(job.started_at));
    if let Some(done) = job.completed_at {
        println!("  Completed: {}", format_millis(done));
    }
    if let Some(ms) = job.duration_ms() {
        println!("  Duration:  {ms} ms");
    }
    println!("  Processed: {}", job.records_processed);
    println!("  Errors:    {}", job.errors_count);
    if let Some(message) = &job.message {
        println!("  Message:   {message}");
    }

    let notes = job.notes();
    if !notes.is_empty() {
        println!();
        println!("Notes:");
        for note in &notes {
            println!("  - {note}");
        }
    }

    if !children.is_empty() {
        println!();
        println!("Nested jobs ({}):", children.len());
        for child in &children {
            print_job_line(child, "  ");
        }
    }

    Ok(())
}

fn print_job_line(job: &SyncJob, indent: &str) {
    println!(
        "{indent}#{:<5} {:<11} {:<20} {:>6} processed {:>4} errors  {}",
        job.id,
        job.kind,
        paint_status(job.status),
        job.records_processed,
        job.errors_count,
        job.message.as_deref().unwrap_or("")
    );
}
