//! Durable job records for every sync invocation.
//!
//! Each tracker owns the jobs it opens under a random owner token and keeps
//! them alive with [`JobTracker::heartbeat`]. Recovery only closes jobs of
//! other owners whose heartbeat has lapsed for longer than [`JOB_LEASE`], so
//! a second `cm` process never finalises a live sync.

use std::time::Duration;

use serde_json::Value;

use crate::error::Result;
use crate::model::{JobKind, JobStatus, SyncJob};
use crate::storage::{JobFilter, SharedStorage};

/// Message stamped on jobs a previous process left open.
pub const ABANDONED_MESSAGE: &str = "abandoned: process exited before completion";

/// How often a running process refreshes its open jobs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long an open job may go without a heartbeat before it counts as
/// abandoned.
pub const JOB_LEASE: Duration = Duration::from_secs(120);

/// An open job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: i64,
    pub kind: JobKind,
    /// Metadata the job was opened with.
    pub metadata: Value,
}

/// Opens and closes job records.
#[derive(Debug, Clone)]
pub struct JobTracker {
    storage: SharedStorage,
    owner: String,
}

impl JobTracker {
    /// A tracker with a fresh owner token.
    #[must_use]
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Token stamped on every job this tracker opens.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Record a new `in_progress` job.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn open(
        &self,
        kind: JobKind,
        message: &str,
        parent: Option<i64>,
        metadata: Value,
    ) -> Result<JobHandle> {
        let id = self
            .storage
            .with(|s| s.create_job(kind, parent, Some(message), &metadata, &self.owner))?;
        tracing::debug!(job_id = id, kind = kind.as_str(), parent, "Opened job");
        Ok(JobHandle { id, kind, metadata })
    }

    /// Move a job to a terminal status.
    ///
    /// Returns `false` when the job had already been closed; nothing is
    /// written in that case.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-terminal status or a failed update.
    pub fn close(
        &self,
        job: &JobHandle,
        status: JobStatus,
        processed: u64,
        errors: u64,
        message: &str,
        metadata: Option<&Value>,
    ) -> Result<bool> {
        let closed = self.storage.with(|s| {
            s.close_job(job.id, status, processed, errors, Some(message), metadata)
        })?;

        if closed {
            tracing::info!(
                job_id = job.id,
                kind = job.kind.as_str(),
                status = status.as_str(),
                processed,
                errors,
                "{message}"
            );
        } else {
            tracing::warn!(job_id = job.id, kind = job.kind.as_str(), "Job already closed");
        }
        Ok(closed)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: i64) -> Result<Option<SyncJob>> {
        self.storage.with(|s| s.get_job(id))
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        self.storage.with(|s| s.list_jobs(filter))
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn children(&self, id: i64) -> Result<Vec<SyncJob>> {
        self.storage.with(|s| s.job_children(id))
    }

    /// Mark this tracker's open jobs as still alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn heartbeat(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let touched = self.storage.with(|s| s.touch_jobs(&self.owner, now))?;
        tracing::trace!(owner = %self.owner, touched, "Job heartbeat");
        Ok(touched)
    }

    /// Close jobs a crashed run left `in_progress`.
    ///
    /// Only jobs of other owners that missed their heartbeat for a full
    /// [`JOB_LEASE`] are closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn recover_abandoned(&self) -> Result<usize> {
        self.recover_stale(JOB_LEASE)
    }

    /// [`recover_abandoned`](Self::recover_abandoned) with an explicit lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn recover_stale(&self, lease: Duration) -> Result<usize> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let stale_at = chrono::Utc::now().timestamp_millis().saturating_sub(lease_ms);
        let closed = self
            .storage
            .with(|s| s.close_abandoned_jobs(ABANDONED_MESSAGE, &self.owner, stale_at))?;
        if closed > 0 {
            tracing::warn!(count = closed, "Closed abandoned jobs");
        }
        Ok(closed)
    }
}
