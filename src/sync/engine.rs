//! Hierarchical sync orchestration.
//!
//! Every operation opens a job, fetches from the remote, reconciles and
//! closes the job exactly once. A full sync opens a root job and runs the
//! other operations beneath it:
//!
//! ```text
//! documents -> per document: workspaces -> main workspace -> elements
//!           -> per PARTSTUDIO element: parts, features
//! ```
//!
//! A failed node aborts only its own subtree. The root records a note for it
//! and carries on with the siblings.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value, json};

use super::jobs::{JobHandle, JobTracker};
use super::locks::KeyedLocks;
use super::reconcile::{self, BatchStats, Incoming, Mirrored, Parent, RawKey};
use crate::config::{MainWorkspacePolicy, Settings};
use crate::error::{Error, Result};
use crate::model::{JobKind, JobStatus, PART_STUDIO};
use crate::remote::types::{
    RemoteDocument, RemoteElement, RemoteFeature, RemotePart, RemoteWorkspace,
};
use crate::remote::{BestEffort, DocumentQuery, RemoteApi};
use crate::storage::SharedStorage;

/// Notes listed in a root job message before the rest are summarised.
const NOTES_IN_MESSAGE: usize = 3;

/// How often an in-flight remote call looks at the cancel flag and deadline.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Knobs the cascade reads from [`Settings`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub document_page_size: u32,
    pub max_document_pages: u32,
    pub default_document_limit: usize,
    pub main_workspace_policy: MainWorkspacePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for EngineSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            document_page_size: settings.document_page_size.max(1),
            max_document_pages: settings.max_document_pages.max(1),
            default_document_limit: settings.default_document_limit,
            main_workspace_policy: settings.main_workspace_policy,
        }
    }
}

/// Per-invocation state threaded through a sync.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
    parent_job: Option<i64>,
    task_id: Option<String>,
}

impl SyncContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a cancellation flag with whoever may cancel this sync.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Fail remote calls issued after `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Gate for every remote call.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` once cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run a remote call, dropping it as soon as the sync is cancelled or
    /// its deadline passes.
    ///
    /// Dropping the call also drops its retry loop, so no further attempt
    /// is issued and no backoff is slept through.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` instead of the call's result once cancelled.
    pub async fn guard<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        self.check()?;
        tokio::select! {
            biased;
            () = self.cancelled() => Err(Error::Cancelled),
            result = call => result,
        }
    }

    /// Resolves once cancelled or past the deadline.
    ///
    /// The flag is read on every poll, so any wake-up of the surrounding
    /// task sees a cancel before the call makes progress.
    async fn cancelled(&self) {
        let mut tick = tokio::time::interval(CANCEL_POLL);
        std::future::poll_fn(|cx| {
            if self.is_cancelled() {
                return Poll::Ready(());
            }
            while tick.poll_tick(cx).is_ready() {}
            Poll::Pending
        })
        .await;
    }

    #[must_use]
    pub const fn parent_job(&self) -> Option<i64> {
        self.parent_job
    }

    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    fn nested_under(&self, job_id: i64) -> Self {
        Self {
            parent_job: Some(job_id),
            ..self.clone()
        }
    }

    /// Job metadata for this invocation: `fields` plus the task id.
    fn metadata(&self, fields: Value) -> Value {
        let mut map = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(task_id) = &self.task_id {
            map.insert("task_id".into(), json!(task_id));
        }
        Value::Object(map)
    }
}

/// What one sync operation did, mirroring its closed job.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub job_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub processed: u64,
    pub errors: u64,
    pub skipped: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl SyncOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// A node's work when it ran to completion.
#[derive(Debug, Default)]
struct NodeReport {
    stats: BatchStats,
    notes: Vec<String>,
}

/// A node that could not proceed, with whatever it persisted first.
#[derive(Debug)]
struct Aborted {
    stats: BatchStats,
    error: Error,
}

impl From<Error> for Aborted {
    fn from(error: Error) -> Self {
        Self {
            stats: BatchStats::default(),
            error,
        }
    }
}

type NodeResult = std::result::Result<NodeReport, Aborted>;

/// Running totals for a full sync.
#[derive(Debug, Default)]
struct Cascade {
    processed: u64,
    errors: u64,
    skipped: u64,
    notes: Vec<String>,
    documents: Vec<String>,
}

impl Cascade {
    fn absorb(&mut self, outcome: &SyncOutcome) {
        self.processed += outcome.processed;
        self.errors += outcome.errors;
        self.skipped += outcome.skipped;
    }

    fn note(&mut self, note: String) {
        tracing::info!(%note, "Cascade note");
        self.notes.push(note);
    }

    fn summary(&self) -> String {
        let mut message = format!(
            "Full sync completed: {} records processed, {} errors",
            self.processed, self.errors
        );
        if !self.notes.is_empty() {
            let shown: Vec<&str> = self
                .notes
                .iter()
                .take(NOTES_IN_MESSAGE)
                .map(String::as_str)
                .collect();
            message.push_str("; ");
            message.push_str(&shown.join("; "));
            let hidden = self.notes.len().saturating_sub(NOTES_IN_MESSAGE);
            if hidden > 0 {
                message.push_str(&format!(" (+{hidden} more)"));
            }
        }
        message
    }
}

/// Drives remote reads into the mirror.
pub struct SyncEngine<R> {
    remote: Arc<R>,
    storage: SharedStorage,
    jobs: JobTracker,
    settings: EngineSettings,
    locks: KeyedLocks,
}

impl<R: RemoteApi> SyncEngine<R> {
    #[must_use]
    pub fn new(remote: Arc<R>, storage: SharedStorage, settings: EngineSettings) -> Self {
        Self {
            remote,
            jobs: JobTracker::new(storage.clone()),
            storage,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    #[must_use]
    pub const fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    #[must_use]
    pub const fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    // ==================
    // Single-level syncs
    // ==================

    /// Mirror the document listing.
    ///
    /// Documents already mirrored are skipped unless `force_refresh`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job record itself cannot be written.
    pub async fn sync_documents(&self, ctx: &SyncContext, force_refresh: bool) -> Result<SyncOutcome> {
        let job = self.jobs.open(
            JobKind::Documents,
            "Starting document sync",
            ctx.parent_job,
            ctx.metadata(json!({ "force_refresh": force_refresh })),
        )?;
        let result = self.document_pass(ctx, force_refresh).await;
        self.finish(&job, result, |s| format!("Synced {} documents", s.processed))
    }

    /// # Errors
    ///
    /// Returns an error only if the job record itself cannot be written.
    pub async fn sync_workspaces(&self, ctx: &SyncContext, document_id: &str) -> Result<SyncOutcome> {
        let job = self.jobs.open(
            JobKind::Workspaces,
            &format!("Starting workspace sync for document {document_id}"),
            ctx.parent_job,
            ctx.metadata(json!({ "document_id": document_id })),
        )?;
        let result = self
            .fetch_and_reconcile::<RemoteWorkspace, _>(
                ctx,
                Parent::of(document_id),
                self.remote.workspaces(document_id),
            )
            .await;
        self.finish(&job, result, |s| {
            format!("Synced {} workspaces for document {document_id}", s.processed)
        })
    }

    /// Mirror a workspace's elements, remembering the workspace they were
    /// seen in.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job record itself cannot be written.
    pub async fn sync_elements(
        &self,
        ctx: &SyncContext,
        document_id: &str,
        workspace_id: &str,
    ) -> Result<SyncOutcome> {
        let job = self.jobs.open(
            JobKind::Elements,
            &format!("Starting element sync for document {document_id}"),
            ctx.parent_job,
            ctx.metadata(json!({ "document_id": document_id, "workspace_id": workspace_id })),
        )?;
        let result = self
            .fetch_and_reconcile::<RemoteElement, _>(
                ctx,
                Parent::in_workspace(document_id, workspace_id),
                self.remote.elements(document_id, workspace_id),
            )
            .await;
        self.finish(&job, result, |s| {
            format!("Synced {} elements for document {document_id}", s.processed)
        })
    }

    /// Mirror a part studio's parts with best-effort mass properties.
    ///
    /// # Errors
    ///
    /// Returns an error only if the job record itself cannot be written.
    pub async fn sync_parts(
        &self,
        ctx: &SyncContext,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
    ) -> Result<SyncOutcome> {
        let job = self.jobs.open(
            JobKind::Parts,
            &format!("Starting part sync for element {element_id}"),
            ctx.parent_job,
            ctx.metadata(json!({
                "document_id": document_id,
                "workspace_id": workspace_id,
                "element_id": element_id,
            })),
        )?;
        let result = self.parts_pass(ctx, document_id, workspace_id, element_id).await;
        self.finish(&job, result, |s| {
            format!("Synced {} parts for element {element_id}", s.processed)
        })
    }

    /// # Errors
    ///
    /// Returns an error only if the job record itself cannot be written.
    pub async fn sync_features(
        &self,
        ctx: &SyncContext,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
    ) -> Result<SyncOutcome> {
        let job = self.jobs.open(
            JobKind::Features,
            &format!("Starting feature sync for element {element_id}"),
            ctx.parent_job,
            ctx.metadata(json!({
                "document_id": document_id,
                "workspace_id": workspace_id,
                "element_id": element_id,
            })),
        )?;
        let result = self
            .fetch_and_reconcile::<RemoteFeature, _>(
                ctx,
                Parent::of(element_id),
                self.remote.features(document_id, workspace_id, element_id),
            )
            .await;
        self.finish(&job, result, |s| {
            format!("Synced {} features for element {element_id}", s.processed)
        })
    }

    // ==================
    // Full sync
    // ==================

    /// Run the whole cascade under one root job.
    ///
    /// With no `document_ids`, the first `default_document_limit` mirrored
    /// documents are descended into.
    ///
    /// # Errors
    ///
    /// Returns an error only if the root job record cannot be written.
    pub async fn full_sync(
        &self,
        ctx: &SyncContext,
        document_ids: &[String],
        force_refresh: bool,
    ) -> Result<SyncOutcome> {
        let root = self.jobs.open(
            JobKind::FullSync,
            "Starting full sync",
            ctx.parent_job,
            ctx.metadata(json!({
                "document_ids": document_ids,
                "force_refresh": force_refresh,
            })),
        )?;

        let nested = ctx.nested_under(root.id);
        let mut cascade = Cascade::default();
        let result = self
            .run_cascade(&nested, document_ids, force_refresh, &mut cascade)
            .await;

        let (status, message) = match result {
            Ok(()) => (JobStatus::Success, cascade.summary()),
            Err(e) => {
                tracing::error!(job_id = root.id, error = %e, "Full sync stopped");
                cascade.errors += 1;
                (JobStatus::Error, format!("Full sync stopped: {e}"))
            }
        };

        let metadata = merge_metadata(
            &root.metadata,
            [
                ("notes", json!(cascade.notes)),
                ("documents", json!(cascade.documents)),
            ],
        );
        self.jobs.close(
            &root,
            status,
            cascade.processed,
            cascade.errors,
            &message,
            Some(&metadata),
        )?;

        Ok(SyncOutcome {
            job_id: root.id,
            kind: JobKind::FullSync,
            status,
            processed: cascade.processed,
            errors: cascade.errors,
            skipped: cascade.skipped,
            message,
            notes: cascade.notes,
        })
    }

    async fn run_cascade(
        &self,
        ctx: &SyncContext,
        document_ids: &[String],
        force_refresh: bool,
        cascade: &mut Cascade,
    ) -> Result<()> {
        let documents = self.sync_documents(ctx, force_refresh).await?;
        cascade.absorb(&documents);
        if !documents.succeeded() {
            cascade.note(format!("document sync failed: {}", documents.message));
        }
        ctx.check()?;

        let targets = self.target_documents(document_ids, cascade)?;
        cascade.documents.clone_from(&targets);

        for document_id in &targets {
            ctx.check()?;
            let _guard = self.locks.lock(document_id).await;
            tracing::debug!(document_id = %document_id, "Descending into document");
            self.cascade_document(ctx, document_id, cascade).await?;
        }

        Ok(())
    }

    fn target_documents(&self, requested: &[String], cascade: &mut Cascade) -> Result<Vec<String>> {
        if requested.is_empty() {
            let limit = self.settings.default_document_limit;
            return self.storage.with(|s| s.document_ids(limit));
        }

        let mut targets: Vec<String> = Vec::with_capacity(requested.len());
        for id in requested {
            if targets.contains(id) {
                continue;
            }
            if self.storage.with(|s| s.document_exists(id))? {
                targets.push(id.clone());
            } else {
                cascade.note(format!("{id}: not mirrored"));
            }
        }
        Ok(targets)
    }

    async fn cascade_document(
        &self,
        ctx: &SyncContext,
        document_id: &str,
        cascade: &mut Cascade,
    ) -> Result<()> {
        let workspaces = self.sync_workspaces(ctx, document_id).await?;
        cascade.absorb(&workspaces);
        if !workspaces.succeeded() {
            cascade.note(format!("{document_id}: workspace sync failed: {}", workspaces.message));
            return ctx.check();
        }

        let Some(workspace_id) = self.pick_workspace(document_id, cascade)? else {
            return Ok(());
        };

        let elements = self.sync_elements(ctx, document_id, &workspace_id).await?;
        cascade.absorb(&elements);
        if !elements.succeeded() {
            cascade.note(format!("{document_id}: element sync failed: {}", elements.message));
            return ctx.check();
        }

        let studios = self.storage.with(|s| {
            s.list_elements(
                Some(document_id),
                Some(&workspace_id),
                Some(PART_STUDIO),
                u32::MAX,
                0,
            )
        })?;

        for studio in &studios {
            let element_id = studio.element_id.as_str();
            ctx.check()?;

            let parts = self.sync_parts(ctx, document_id, &workspace_id, element_id).await?;
            cascade.absorb(&parts);
            if !parts.succeeded() {
                cascade.note(format!("{document_id}/{element_id}: part sync failed: {}", parts.message));
            }
            ctx.check()?;

            let features = self
                .sync_features(ctx, document_id, &workspace_id, element_id)
                .await?;
            cascade.absorb(&features);
            if !features.succeeded() {
                cascade.note(format!(
                    "{document_id}/{element_id}: feature sync failed: {}",
                    features.message
                ));
            }
        }

        Ok(())
    }

    /// The workspace whose elements get mirrored, or `None` with a note.
    fn pick_workspace(&self, document_id: &str, cascade: &mut Cascade) -> Result<Option<String>> {
        if let Some(main) = self.storage.with(|s| s.main_workspace(document_id))? {
            return Ok(Some(main.workspace_id));
        }

        let Some(first) = self.storage.with(|s| s.first_workspace(document_id))? else {
            cascade.note(format!("{document_id}: no workspaces"));
            return Ok(None);
        };

        match self.settings.main_workspace_policy {
            MainWorkspacePolicy::Skip => {
                cascade.note(format!("{document_id}: no main workspace"));
                Ok(None)
            }
            MainWorkspacePolicy::FirstWorkspace => {
                cascade.note(format!(
                    "{document_id}: no main workspace, using first workspace {}",
                    first.workspace_id
                ));
                Ok(Some(first.workspace_id))
            }
        }
    }

    // ==================
    // Node bodies
    // ==================

    async fn fetch_and_reconcile<T, F>(&self, ctx: &SyncContext, parent: Parent<'_>, fetch: F) -> NodeResult
    where
        T: Mirrored,
        F: Future<Output = Result<Vec<Value>>>,
    {
        let records = ctx.guard(fetch).await?;
        let stats = reconcile::reconcile::<T>(&self.storage, parent, records)?;
        Ok(NodeReport {
            stats,
            notes: Vec::new(),
        })
    }

    async fn document_pass(&self, ctx: &SyncContext, force_refresh: bool) -> NodeResult {
        let mut report = NodeReport::default();
        let listed = self.list_documents(ctx, &mut report).await?;

        let mut details = Vec::new();
        let mut interrupted = None;

        for raw in &listed {
            let document_id = match reconcile::raw_key::<RemoteDocument>(raw) {
                RawKey::Present(id) => id,
                RawKey::Missing => {
                    report.stats.skipped += 1;
                    continue;
                }
                RawKey::Invalid(reason) => {
                    tracing::warn!(%reason, "Invalid document in listing");
                    report.stats.errors += 1;
                    continue;
                }
            };

            if !force_refresh && self.storage.with(|s| s.document_exists(document_id))? {
                report.stats.skipped += 1;
                continue;
            }

            match ctx.guard(self.remote.document(document_id)).await {
                Ok(detail) => details.push(detail),
                Err(Error::Cancelled) => {
                    interrupted = Some(Error::Cancelled);
                    break;
                }
                Err(e) => {
                    tracing::warn!(document_id, error = %e, "Failed to fetch document detail");
                    report.stats.errors += 1;
                }
            }
        }

        let batch = reconcile::reconcile::<RemoteDocument>(&self.storage, Parent::ROOT, details)?;
        report.stats.merge(batch);

        match interrupted {
            Some(error) => Err(Aborted {
                stats: report.stats,
                error,
            }),
            None => Ok(report),
        }
    }

    /// Page through the listing. Only a failure on the first page aborts.
    async fn list_documents(
        &self,
        ctx: &SyncContext,
        report: &mut NodeReport,
    ) -> std::result::Result<Vec<Value>, Aborted> {
        let page_size = self.settings.document_page_size;
        let mut listed = Vec::new();

        for page in 0..self.settings.max_document_pages {
            let query = DocumentQuery {
                offset: page.saturating_mul(page_size),
                limit: page_size,
                ..DocumentQuery::default()
            };

            match ctx.guard(self.remote.list_documents(&query)).await {
                Ok(fetched) => {
                    let more = fetched.next.is_some();
                    listed.extend(fetched.items);
                    if !more {
                        break;
                    }
                }
                Err(e) if page == 0 || matches!(e, Error::Cancelled) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(page, error = %e, "Document listing stopped early");
                    report.stats.errors += 1;
                    report
                        .notes
                        .push(format!("document listing stopped at page {}: {e}", page + 1));
                    break;
                }
            }
        }

        Ok(listed)
    }

    async fn parts_pass(
        &self,
        ctx: &SyncContext,
        document_id: &str,
        workspace_id: &str,
        element_id: &str,
    ) -> NodeResult {
        let records = ctx
            .guard(self.remote.parts(document_id, workspace_id, element_id))
            .await?;
        let mut staged = reconcile::stage::<RemotePart>(records);

        let mut interrupted = None;
        for item in &mut staged {
            let Incoming::Record(part) = item else {
                continue;
            };
            let fetched = ctx
                .guard(
                    self.remote
                        .mass_properties(document_id, workspace_id, element_id, &part.part_id),
                )
                .await;
            part.mass_properties = Some(match fetched {
                Ok(value) => BestEffort::Fetched(value),
                Err(Error::Cancelled) => {
                    // parts staged so far still get written; the rest keep
                    // their stored mass properties
                    interrupted = Some(Error::Cancelled);
                    break;
                }
                Err(e) if e.is_absent() => BestEffort::Absent,
                Err(e) => {
                    tracing::warn!(
                        element_id,
                        part_id = %part.part_id,
                        error = %e,
                        "Mass properties unavailable"
                    );
                    BestEffort::Failed(e.to_string())
                }
            });
        }

        let stats = reconcile::apply(&self.storage, Parent::of(element_id), staged)?;
        match interrupted {
            Some(error) => Err(Aborted { stats, error }),
            None => Ok(NodeReport {
                stats,
                notes: Vec::new(),
            }),
        }
    }

    /// Close `job` from a node's result.
    fn finish(
        &self,
        job: &JobHandle,
        result: NodeResult,
        describe: impl FnOnce(&BatchStats) -> String,
    ) -> Result<SyncOutcome> {
        let (status, stats, message, notes) = match result {
            Ok(report) => {
                let message = describe(&report.stats);
                (JobStatus::Success, report.stats, message, report.notes)
            }
            Err(Aborted { mut stats, error }) => {
                tracing::error!(job_id = job.id, kind = job.kind.as_str(), error = %error, "Sync failed");
                stats.errors += 1;
                (JobStatus::Error, stats, error.to_string(), Vec::new())
            }
        };

        let metadata = (!notes.is_empty())
            .then(|| merge_metadata(&job.metadata, [("notes", json!(notes))]));
        self.jobs.close(
            job,
            status,
            stats.processed,
            stats.errors,
            &message,
            metadata.as_ref(),
        )?;

        Ok(SyncOutcome {
            job_id: job.id,
            kind: job.kind,
            status,
            processed: stats.processed,
            errors: stats.errors,
            skipped: stats.skipped,
            message,
            notes,
        })
    }
}

fn merge_metadata<const N: usize>(base: &Value, entries: [(&str, Value); N]) -> Value {
    let mut map = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in entries {
        map.insert(key.to_string(), value);
    }
    Value::Object(map)
}
