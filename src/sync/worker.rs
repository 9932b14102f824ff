//! Background worker pool for sync tasks.
//!
//! `submit` queues a task and returns at once with its id. The job records
//! written by the task are the durable account of how it went; the
//! in-memory [`TaskReport`]s only exist for whoever drains the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::{SyncContext, SyncEngine, SyncOutcome};
use super::jobs::{HEARTBEAT_INTERVAL, JobTracker};
use crate::error::{Error, Result};
use crate::model::JobKind;
use crate::remote::RemoteApi;

/// What a task should sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Documents {
        force_refresh: bool,
    },
    Workspaces {
        document_id: String,
    },
    Elements {
        document_id: String,
        workspace_id: String,
    },
    Parts {
        document_id: String,
        workspace_id: String,
        element_id: String,
    },
    Features {
        document_id: String,
        workspace_id: String,
        element_id: String,
    },
    Full {
        document_ids: Vec<String>,
        force_refresh: bool,
    },
}

impl SyncRequest {
    /// Kind of the top-level job this request opens.
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::Documents { .. } => JobKind::Documents,
            Self::Workspaces { .. } => JobKind::Workspaces,
            Self::Elements { .. } => JobKind::Elements,
            Self::Parts { .. } => JobKind::Parts,
            Self::Features { .. } => JobKind::Features,
            Self::Full { .. } => JobKind::FullSync,
        }
    }
}

/// Acknowledgment for an accepted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub kind: JobKind,
    cancel: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Ask the task to stop before its next remote call.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// How a task ended.
#[derive(Debug)]
pub struct TaskReport {
    pub task_id: String,
    pub kind: JobKind,
    /// `Err` only when the job record itself could not be written.
    pub outcome: Result<SyncOutcome>,
}

struct SyncTask {
    task_id: String,
    request: SyncRequest,
    ctx: SyncContext,
}

type Registry = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

pub struct WorkerPool {
    sender: mpsc::UnboundedSender<SyncTask>,
    reports: mpsc::UnboundedReceiver<TaskReport>,
    workers: Vec<JoinHandle<()>>,
    /// Keeps this process's open jobs from being recovered by another.
    heartbeat: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    /// Cancellation flags of queued and running tasks.
    active: Registry,
    cascade_timeout: Option<Duration>,
}

impl WorkerPool {
    /// Start `worker_count` workers (at least one) on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new<R: RemoteApi + 'static>(
        engine: Arc<SyncEngine<R>>,
        worker_count: usize,
        cascade_timeout: Option<Duration>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<SyncTask>();
        let (report_tx, reports) = mpsc::unbounded_channel::<TaskReport>();
        let queue = Arc::new(AsyncMutex::new(receiver));
        let active: Registry = Arc::default();

        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&engine),
                    Arc::clone(&queue),
                    report_tx.clone(),
                    Arc::clone(&active),
                ))
            })
            .collect();

        let heartbeat = tokio::spawn(keep_jobs_alive(engine.jobs().clone()));

        info!(workers = worker_count, "Started sync workers");

        Self {
            sender,
            reports,
            workers,
            heartbeat,
            shutdown: Arc::new(AtomicBool::new(false)),
            active,
            cascade_timeout,
        }
    }

    /// Queue a sync and return its handle immediately.
    ///
    /// # Errors
    ///
    /// Returns `Error::Sync` after [`shutdown`](Self::shutdown) or if every
    /// worker has stopped.
    pub fn submit(&self, request: SyncRequest) -> Result<TaskHandle> {
        if self.is_shutdown() {
            return Err(Error::Sync("worker pool is shut down".into()));
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        let kind = request.kind();
        let ctx = SyncContext::new()
            .with_cancel(Arc::clone(&cancel))
            .with_timeout(self.cascade_timeout)
            .with_task_id(task_id.clone());

        self.registry().insert(task_id.clone(), Arc::clone(&cancel));

        let task = SyncTask {
            task_id: task_id.clone(),
            request,
            ctx,
        };
        if self.sender.send(task).is_err() {
            self.registry().remove(&task_id);
            return Err(Error::Sync("no sync workers are running".into()));
        }

        info!(task_id = %task_id, kind = kind.as_str(), "Accepted sync task");
        Ok(TaskHandle {
            task_id,
            kind,
            cancel,
        })
    }

    /// Cancel every queued and running task and refuse new ones.
    ///
    /// Cancelled tasks still close their jobs, as `error`.
    pub fn shutdown(&self) {
        info!("Shutting down sync workers");
        self.shutdown.store(true, Ordering::SeqCst);
        for flag in self.registry().values() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Tasks accepted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.registry().len()
    }

    /// Wait for the queue to empty and every worker to stop.
    pub async fn drain(self) -> Vec<TaskReport> {
        let Self {
            sender,
            mut reports,
            workers,
            heartbeat,
            ..
        } = self;

        // Closing the queue lets idle workers exit
        drop(sender);

        for (worker_id, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(worker_id, error = %e, "Sync worker panicked");
            }
        }
        heartbeat.abort();

        let mut finished = Vec::new();
        while let Some(report) = reports.recv().await {
            finished.push(report);
        }
        debug!(count = finished.len(), "Drained sync workers");
        finished
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn keep_jobs_alive(jobs: JobTracker) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    // the first tick completes immediately and jobs are opened fresh
    tick.tick().await;
    loop {
        tick.tick().await;
        if let Err(e) = jobs.heartbeat() {
            warn!(error = %e, "Failed to refresh job heartbeat");
        }
    }
}

async fn run_worker<R: RemoteApi + 'static>(
    worker_id: usize,
    engine: Arc<SyncEngine<R>>,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<SyncTask>>>,
    reports: mpsc::UnboundedSender<TaskReport>,
    active: Registry,
) {
    debug!(worker_id, "Sync worker started");

    loop {
        let next = queue.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };

        debug!(worker_id, task_id = %task.task_id, "Running sync task");
        let outcome = execute(&engine, &task).await;
        if let Err(e) = &outcome {
            error!(task_id = %task.task_id, error = %e, "Sync task could not record its job");
        }

        active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&task.task_id);

        let report = TaskReport {
            task_id: task.task_id,
            kind: task.request.kind(),
            outcome,
        };
        if reports.send(report).is_err() {
            debug!(worker_id, "Report receiver dropped");
        }
    }

    debug!(worker_id, "Sync worker stopped");
}

async fn execute<R: RemoteApi>(engine: &SyncEngine<R>, task: &SyncTask) -> Result<SyncOutcome> {
    let ctx = &task.ctx;
    match &task.request {
        SyncRequest::Documents { force_refresh } => engine.sync_documents(ctx, *force_refresh).await,
        SyncRequest::Workspaces { document_id } => engine.sync_workspaces(ctx, document_id).await,
        SyncRequest::Elements {
            document_id,
            workspace_id,
        } => engine.sync_elements(ctx, document_id, workspace_id).await,
        SyncRequest::Parts {
            document_id,
            workspace_id,
            element_id,
        } => {
            engine
                .sync_parts(ctx, document_id, workspace_id, element_id)
                .await
        }
        SyncRequest::Features {
            document_id,
            workspace_id,
            element_id,
        } => {
            engine
                .sync_features(ctx, document_id, workspace_id, element_id)
                .await
        }
        SyncRequest::Full {
            document_ids,
            force_refresh,
        } => engine.full_sync(ctx, document_ids, *force_refresh).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;
    use crate::remote::{DocumentPage, DocumentQuery};
    use crate::storage::{SharedStorage, SqliteStorage};
    use crate::sync::engine::EngineSettings;
    use serde_json::{Value, json};

    /// Remote with one document and one workspace.
    struct TinyRemote;

    impl RemoteApi for TinyRemote {
        async fn list_documents(&self, _query: &DocumentQuery) -> Result<DocumentPage> {
            Ok(DocumentPage {
                items: vec![json!({"id": "d1"})],
                next: None,
            })
        }

        async fn document(&self, document_id: &str) -> Result<Value> {
            Ok(json!({"id": document_id, "name": "Tiny"}))
        }

        async fn workspaces(&self, _document_id: &str) -> Result<Vec<Value>> {
            Ok(vec![json!({"id": "w1", "isMain": true})])
        }

        async fn elements(&self, _d: &str, _w: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }

        async fn parts(&self, _d: &str, _w: &str, _e: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }

        async fn features(&self, _d: &str, _w: &str, _e: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }

        async fn mass_properties(&self, _d: &str, _w: &str, _e: &str, _p: &str) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn engine() -> Arc<SyncEngine<TinyRemote>> {
        let storage = SharedStorage::new(SqliteStorage::open_memory().unwrap());
        Arc::new(SyncEngine::new(Arc::new(TinyRemote), storage, EngineSettings::default()))
    }

    #[tokio::test]
    async fn test_submit_then_drain() {
        let engine = engine();
        let pool = WorkerPool::new(Arc::clone(&engine), 2, None);

        let full = pool
            .submit(SyncRequest::Full {
                document_ids: vec![],
                force_refresh: false,
            })
            .unwrap();
        let workspaces = pool
            .submit(SyncRequest::Workspaces {
                document_id: "d1".into(),
            })
            .unwrap();
        assert_ne!(full.task_id, workspaces.task_id);
        assert_eq!(full.kind, JobKind::FullSync);

        let reports = pool.drain().await;
        assert_eq!(reports.len(), 2);

        for report in reports {
            let outcome = report.outcome.unwrap();
            assert_eq!(outcome.status, JobStatus::Success);
            let job = engine.jobs().get(outcome.job_id).unwrap().unwrap();
            assert_eq!(job.metadata["task_id"], report.task_id.as_str());
        }
    }

    #[tokio::test]
    async fn test_shutdown_rejects_and_cancels() {
        let engine = engine();
        let pool = WorkerPool::new(Arc::clone(&engine), 1, None);

        let queued = pool
            .submit(SyncRequest::Documents {
                force_refresh: false,
            })
            .unwrap();
        pool.shutdown();
        assert!(queued.is_cancelled());
        assert!(
            pool.submit(SyncRequest::Documents {
                force_refresh: false
            })
            .is_err()
        );

        let reports = pool.drain().await;
        assert_eq!(reports.len(), 1);
        let outcome = reports.into_iter().next().unwrap().outcome.unwrap();
        assert_eq!(outcome.status, JobStatus::Error);
        assert!(engine.storage().with(|s| s.get_document("d1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_cancels_single_task() {
        let engine = engine();
        let pool = WorkerPool::new(Arc::clone(&engine), 1, None);

        let cancelled = pool
            .submit(SyncRequest::Workspaces {
                document_id: "d1".into(),
            })
            .unwrap();
        let kept = pool
            .submit(SyncRequest::Workspaces {
                document_id: "d1".into(),
            })
            .unwrap();
        cancelled.cancel();
        assert_eq!(pool.pending(), 2);

        let reports = pool.drain().await;
        let status_of = |id: &str| {
            reports
                .iter()
                .find(|r| r.task_id == id)
                .and_then(|r| r.outcome.as_ref().ok())
                .map(|o| o.status)
        };
        assert_eq!(status_of(&cancelled.task_id), Some(JobStatus::Error));
        assert_eq!(status_of(&kept.task_id), Some(JobStatus::Success));
    }
}
